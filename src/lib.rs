#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! Library crate backing the `usbvfiod` binary and its `remote` companion
//! tool. The parts that both sides of the hot-attach socket need to agree on
//! live here; everything device- and protocol-emulation-specific stays in the
//! binary crate.

pub mod hotplug_protocol;
