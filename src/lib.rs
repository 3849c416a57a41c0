//! Etag cache for PostGIS feature services, kept consistent with table
//! mutations through PostgreSQL `LISTEN`/`NOTIFY`.

pub mod application;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod infra;
pub mod listener;
