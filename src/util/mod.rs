pub mod b64;
pub mod sig_down;

pub use b64::Base64Bytes;
pub use sig_down::SigDown;
