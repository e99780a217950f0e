#![no_std]

#[cfg(feature = "std")]
extern crate std;

mod options;

pub use self::options::Options;
