//! # Runner Launcher Library
//!
//! Webhook-triggered launcher for ephemeral GitHub Actions runners. A queued
//! `workflow_job` delivery starts one execution of a Cloud Run job whose
//! container registers a single-use self-hosted runner.

pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod github_app;
pub mod handlers;
pub mod identity;
pub mod jobs;
pub mod metadata;
pub mod secrets;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
