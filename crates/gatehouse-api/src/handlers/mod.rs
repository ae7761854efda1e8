//! API handlers
//!
//! Author: hephaex@gmail.com

pub mod admin;
pub mod auth;
pub mod health;
pub mod invitations;
