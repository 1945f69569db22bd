pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
mod error;
pub mod message;
pub mod output;
pub mod response;
pub mod session;
pub mod usb;

pub type Result<T> = std::result::Result<T, error::AntError>;

pub use config::Settings;
pub use crossbeam_channel::unbounded;
pub use error::AntError;
pub use session::{Request, Session};
pub use usb::{Context, Transport, UsbContext, UsbDevice};

pub use message::combine;
