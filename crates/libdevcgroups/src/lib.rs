//! Grants running containers access to host device nodes that were bind-mounted
//! into them, by editing the device-control cgroup of the container's process.
//! Both the legacy `devices` controller and the unified hierarchy's device
//! programs are supported.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

#[cfg(test)]
#[macro_use]
extern crate mockall;


pub mod cgroup;
pub mod common;
pub mod config;
pub mod device;
pub mod reconcile;
