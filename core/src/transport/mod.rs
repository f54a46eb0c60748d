// Transport module: BLE link plumbing

pub mod ble;

pub use ble::{
    CentralEvent, CentralRadio, ChannelEvent, DuplexChannel, LoopbackAir, PeripheralEvent,
    PeripheralRadio,
};
