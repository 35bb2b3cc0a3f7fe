//! Station: the set of instruments available to a run.
//!
//! Each instrument sits in an [`InstrumentSlot`] that pairs the shared driver with an
//! exclusive lock. Acquiring a slot yields an RAII [`InstrumentHandle`]; the lock is
//! released when the handle drops, on every exit path. A slot that is missing or
//! already held fails with [`InstrumentError::Unavailable`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{InstrumentError, InstrumentResult};
use crate::hardware::capabilities::{
    Electrometer, EnvironmentBox, LcrMeter, SourceMeter, SwitchMatrix, TableController,
};

/// Instrument roles a measurement can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentRole {
    /// High-voltage source
    HvSource,
    /// Low-voltage source
    VSource,
    /// Electrometer
    Electrometer,
    /// LCR meter
    LcrMeter,
    /// Switching matrix
    Matrix,
    /// Environment box
    Environment,
}

impl InstrumentRole {
    /// Resource name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentRole::HvSource => "hvsrc",
            InstrumentRole::VSource => "vsrc",
            InstrumentRole::Electrometer => "elm",
            InstrumentRole::LcrMeter => "lcr",
            InstrumentRole::Matrix => "matrix",
            InstrumentRole::Environment => "environ",
        }
    }
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared instrument plus the lock guarding exclusive use.
pub struct InstrumentSlot<T: ?Sized> {
    device: Arc<T>,
    lock: Arc<Mutex<()>>,
}

impl<T: ?Sized> Clone for InstrumentSlot<T> {
    fn clone(&self) -> Self {
        Self {
            device: Arc::clone(&self.device),
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<T: ?Sized> InstrumentSlot<T> {
    /// Wrap a driver.
    pub fn new(device: Arc<T>) -> Self {
        Self {
            device,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Take exclusive use of the instrument without waiting.
    pub fn try_acquire(&self, role: InstrumentRole) -> InstrumentResult<InstrumentHandle<T>> {
        let guard = Arc::clone(&self.lock)
            .try_lock_owned()
            .map_err(|_| InstrumentError::Unavailable(format!("{role} (busy)")))?;
        Ok(InstrumentHandle {
            device: Arc::clone(&self.device),
            _guard: guard,
        })
    }

    /// True while a handle is held.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Exclusive access to an instrument. Dropping it releases the instrument.
pub struct InstrumentHandle<T: ?Sized> {
    device: Arc<T>,
    _guard: OwnedMutexGuard<()>,
}

impl<T: ?Sized> Deref for InstrumentHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.device
    }
}

fn acquire<T: ?Sized>(
    slot: &Option<InstrumentSlot<T>>,
    role: InstrumentRole,
) -> InstrumentResult<InstrumentHandle<T>> {
    slot.as_ref()
        .ok_or_else(|| InstrumentError::Unavailable(role.to_string()))?
        .try_acquire(role)
}

/// Instruments and table of one station.
#[derive(Clone, Default)]
pub struct Station {
    hvsrc: Option<InstrumentSlot<dyn SourceMeter>>,
    vsrc: Option<InstrumentSlot<dyn SourceMeter>>,
    elm: Option<InstrumentSlot<dyn Electrometer>>,
    lcr: Option<InstrumentSlot<dyn LcrMeter>>,
    matrix: Option<InstrumentSlot<dyn SwitchMatrix>>,
    environ: Option<InstrumentSlot<dyn EnvironmentBox>>,
    table: Option<Arc<dyn TableController>>,
}

impl Station {
    /// Empty station.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add the HV source.
    pub fn with_hvsrc(mut self, device: Arc<dyn SourceMeter>) -> Self {
        self.hvsrc = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the V source.
    pub fn with_vsrc(mut self, device: Arc<dyn SourceMeter>) -> Self {
        self.vsrc = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the electrometer.
    pub fn with_elm(mut self, device: Arc<dyn Electrometer>) -> Self {
        self.elm = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the LCR meter.
    pub fn with_lcr(mut self, device: Arc<dyn LcrMeter>) -> Self {
        self.lcr = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the switching matrix.
    pub fn with_matrix(mut self, device: Arc<dyn SwitchMatrix>) -> Self {
        self.matrix = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the environment box.
    pub fn with_environ(mut self, device: Arc<dyn EnvironmentBox>) -> Self {
        self.environ = Some(InstrumentSlot::new(device));
        self
    }

    /// Builder: add the wafer table.
    pub fn with_table(mut self, table: Arc<dyn TableController>) -> Self {
        self.table = Some(table);
        self
    }

    /// Acquire the HV source.
    pub fn hvsrc(&self) -> InstrumentResult<InstrumentHandle<dyn SourceMeter>> {
        acquire(&self.hvsrc, InstrumentRole::HvSource)
    }

    /// Acquire the V source.
    pub fn vsrc(&self) -> InstrumentResult<InstrumentHandle<dyn SourceMeter>> {
        acquire(&self.vsrc, InstrumentRole::VSource)
    }

    /// Acquire the electrometer.
    pub fn elm(&self) -> InstrumentResult<InstrumentHandle<dyn Electrometer>> {
        acquire(&self.elm, InstrumentRole::Electrometer)
    }

    /// Acquire the LCR meter.
    pub fn lcr(&self) -> InstrumentResult<InstrumentHandle<dyn LcrMeter>> {
        acquire(&self.lcr, InstrumentRole::LcrMeter)
    }

    /// Acquire the switching matrix.
    pub fn matrix(&self) -> InstrumentResult<InstrumentHandle<dyn SwitchMatrix>> {
        acquire(&self.matrix, InstrumentRole::Matrix)
    }

    /// Acquire the environment box.
    pub fn environ(&self) -> InstrumentResult<InstrumentHandle<dyn EnvironmentBox>> {
        acquire(&self.environ, InstrumentRole::Environment)
    }

    /// The wafer table, if this station has one.
    pub fn table(&self) -> Option<Arc<dyn TableController>> {
        self.table.clone()
    }

    /// True if the station has an instrument for `role`, held or not.
    pub fn has(&self, role: InstrumentRole) -> bool {
        match role {
            InstrumentRole::HvSource => self.hvsrc.is_some(),
            InstrumentRole::VSource => self.vsrc.is_some(),
            InstrumentRole::Electrometer => self.elm.is_some(),
            InstrumentRole::LcrMeter => self.lcr.is_some(),
            InstrumentRole::Matrix => self.matrix.is_some(),
            InstrumentRole::Environment => self.environ.is_some(),
        }
    }

    /// Acquire every instrument of `roles`, all or nothing.
    pub fn acquire_all(&self, roles: &[InstrumentRole]) -> InstrumentResult<Instruments> {
        let mut instruments = Instruments::default();
        for role in roles {
            match role {
                InstrumentRole::HvSource => instruments.hvsrc = Some(self.hvsrc()?),
                InstrumentRole::VSource => instruments.vsrc = Some(self.vsrc()?),
                InstrumentRole::Electrometer => instruments.elm = Some(self.elm()?),
                InstrumentRole::LcrMeter => instruments.lcr = Some(self.lcr()?),
                InstrumentRole::Matrix => instruments.matrix = Some(self.matrix()?),
                InstrumentRole::Environment => instruments.environ = Some(self.environ()?),
            }
        }
        Ok(instruments)
    }
}

/// Instruments held for the duration of one measurement.
#[derive(Default)]
pub struct Instruments {
    hvsrc: Option<InstrumentHandle<dyn SourceMeter>>,
    vsrc: Option<InstrumentHandle<dyn SourceMeter>>,
    elm: Option<InstrumentHandle<dyn Electrometer>>,
    lcr: Option<InstrumentHandle<dyn LcrMeter>>,
    matrix: Option<InstrumentHandle<dyn SwitchMatrix>>,
    environ: Option<InstrumentHandle<dyn EnvironmentBox>>,
}

fn held<'a, T: ?Sized>(
    handle: &'a Option<InstrumentHandle<T>>,
    role: InstrumentRole,
) -> InstrumentResult<&'a T> {
    handle
        .as_deref()
        .ok_or_else(|| InstrumentError::Unavailable(role.to_string()))
}

impl Instruments {
    /// Held HV source.
    pub fn hvsrc(&self) -> InstrumentResult<&dyn SourceMeter> {
        held(&self.hvsrc, InstrumentRole::HvSource)
    }

    /// Held V source.
    pub fn vsrc(&self) -> InstrumentResult<&dyn SourceMeter> {
        held(&self.vsrc, InstrumentRole::VSource)
    }

    /// Held electrometer.
    pub fn elm(&self) -> InstrumentResult<&dyn Electrometer> {
        held(&self.elm, InstrumentRole::Electrometer)
    }

    /// Held LCR meter.
    pub fn lcr(&self) -> InstrumentResult<&dyn LcrMeter> {
        held(&self.lcr, InstrumentRole::LcrMeter)
    }

    /// Held switching matrix.
    pub fn matrix(&self) -> InstrumentResult<&dyn SwitchMatrix> {
        held(&self.matrix, InstrumentRole::Matrix)
    }

    /// Held environment box.
    pub fn environ(&self) -> InstrumentResult<&dyn EnvironmentBox> {
        held(&self.environ, InstrumentRole::Environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSourceMeter;

    #[test]
    fn missing_role_is_unavailable() {
        let station = Station::new();
        assert!(matches!(
            station.hvsrc().err(),
            Some(InstrumentError::Unavailable(_))
        ));
    }

    #[test]
    fn handle_is_exclusive_until_dropped() {
        let station = Station::new().with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")));
        let first = station.hvsrc().unwrap();
        assert!(station.hvsrc().is_err());
        drop(first);
        assert!(station.hvsrc().is_ok());
    }

    #[test]
    fn acquire_all_releases_on_failure() {
        let station = Station::new().with_hvsrc(Arc::new(MockSourceMeter::new("hvsrc")));
        let result =
            station.acquire_all(&[InstrumentRole::HvSource, InstrumentRole::Electrometer]);
        assert!(result.is_err());
        assert!(station.hvsrc().is_ok());
        assert!(station.has(InstrumentRole::HvSource));
        assert!(!station.has(InstrumentRole::Electrometer));
    }
}
