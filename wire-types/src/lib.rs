#![no_std]

extern crate alloc;

pub mod checksum;
pub mod ip;
pub mod prependable;
pub mod tcp;
