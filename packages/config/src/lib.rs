// ABOUTME: Shared configuration vocabulary for Botyard
// ABOUTME: Environment variable names and their default values

pub mod constants;

pub use constants::*;
