//! Android package (APK/ZIP) container handling.

pub mod container;
