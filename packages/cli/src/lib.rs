// ABOUTME: Library side of the botyard operator CLI
// ABOUTME: Exposes configuration loading so it can be tested apart from the binary

pub mod config;
