//! # Code
//!
//! Helpers for looking at the machine code we write into the image

pub mod x86;
