//! Shared test infrastructure for the razorbus workspace.

pub mod db;
