//! Station hardware: capability traits, the station registry and mock instruments.

pub mod capabilities;
pub mod mock;
pub mod station;

pub use capabilities::{
    Electrometer, EnvironmentBox, EnvironmentReading, FilterSettings, FilterType, Instrument,
    IntegrationTime, LcrMeter, MoveCompletion, RouteTerminal, SenseMode, SourceMeter, SwitchMatrix,
    TableController,
};
pub use station::{InstrumentHandle, InstrumentRole, InstrumentSlot, Instruments, Station};
