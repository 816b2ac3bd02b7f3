pub mod credit;
pub mod subscription;
pub mod usage;
pub mod webhook;
