//! Small helpers shared by the value model and the interceptors.

pub mod percent;
