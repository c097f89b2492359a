//! Documentation Catalog MCP Service
//!
//! This crate provides a Model Context Protocol (MCP) service that catalogs
//! reference documentation, fetches it from websites, GitHub, or local files,
//! and serves it through a bounded in-memory cache. A resource monitor keeps
//! process pressure in check by sampling memory, cpu, and descriptor usage
//! and reclaiming idle connections when thresholds are crossed.
//!
//! # Features
//!
//! - Catalog of named documents with categories and tags, persisted as JSON
//! - Size-bounded LRU cache with TTL expiry and a background sweeper
//! - Process resource monitoring with threshold-triggered cleanup
//! - MCP server implementation over SSE or stdio transports
//!
//! # Modules
//!
//! - [`cache`]: size/age/LRU-bounded in-memory cache
//! - [`resources`]: resource sampling, registries, and cleanup orchestration
//! - [`catalog`]: documentation metadata store and search
//! - [`fetcher`]: content fetchers for the supported source kinds
//! - [`mcp`]: MCP server implementation and tool handling
//! - [`server`]: SSE/stdio startup wiring

pub mod cache;
pub mod catalog;
pub mod fetcher;
pub mod mcp;
pub mod resources;
pub mod server;
