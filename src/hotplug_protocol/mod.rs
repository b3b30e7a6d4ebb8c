//! Wire protocol spoken over the hot-attach Unix domain socket between
//! `usbvfiod` and the `remote` companion binary.

pub mod command;
pub mod device_paths;
pub mod response;
