//! Table moves and contact settling.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::info;

use crate::config::SharedPosition;
use crate::error::{PqcError, PqcResult};
use crate::events::EventSender;
use crate::hardware::TableController;
use crate::sequence::Position;
use crate::units::format_metric;

/// Number of progress increments of the contact delay.
const CONTACT_DELAY_STEPS: u32 = 25;

/// Move the table to `position` and wait for completion.
///
/// Does nothing if the station has no table or the table is not running and enabled.
/// On success the reached position is published through `shared`; on timeout the
/// cached position is left unchanged.
pub async fn safe_move_table(
    table: Option<&Arc<dyn TableController>>,
    position: Position,
    move_timeout: Duration,
    shared: &SharedPosition,
    events: &EventSender,
) -> PqcResult<()> {
    let Some(table) = table else {
        return Ok(());
    };
    if !(table.is_running().await && table.is_enabled().await) {
        return Ok(());
    }
    info!("Safe move table to {position}");
    events.message("Moving table...");
    let completion = table.absolute_move(position).await?;
    let reached = match timeout(move_timeout, completion).await {
        Err(_) => return Err(PqcError::TableMoveTimeout(move_timeout)),
        Ok(Err(_)) => return Err(PqcError::TableMove("table controller dropped the move".into())),
        Ok(Ok(result)) => result?,
    };
    shared.set(reached);
    events.message("Moving table... done.");
    info!("Safe move table to {position}... done.");
    Ok(())
}

/// Raise `z` by the absolute re-contact overdrive.
pub fn add_retry_overdrive(position: Position, overdrive: f64) -> Position {
    let overdrive = overdrive.abs();
    info!(" => applying re-contact overdrive: {overdrive} mm");
    position.with_z_offset(overdrive)
}

/// Settle after contacting, reporting progress in 25 increments.
pub async fn apply_contact_delay(delay: Duration, events: &EventSender) {
    if delay.is_zero() {
        return;
    }
    info!("Applying contact delay: {} s", delay.as_secs_f64());
    events.message(format!(
        "Applying contact delay of {}...",
        format_metric(delay.as_secs_f64(), "s")
    ));
    let fraction = delay / CONTACT_DELAY_STEPS;
    for step in 0..CONTACT_DELAY_STEPS {
        events.progress(step as usize + 1, CONTACT_DELAY_STEPS as usize);
        sleep(fraction).await;
    }
}
