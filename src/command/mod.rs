pub mod bus;
pub mod encoder;
pub mod template;

pub use bus::{CommandDispatcher, DeviceBus, DispatchHandle, LoggingBus};
pub use encoder::{encode, encode_change, encode_init, EncodeMode, ResolvedPacket, RuntimeValues};
pub use template::{
    parse_token, resolve, resolve_all, CommandField, CommandTemplate, Placeholder, Protocol,
    RawCommand, RawToken, Token,
};
