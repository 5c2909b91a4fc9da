// Cache key layout and compatibility sets
pub mod keys;

// TTL cache seam and the in-memory store
pub mod cache;

// Credential records and dual-write storage
pub mod credentials;

// Configuration, env overrides and runtime overlay
pub mod config;

// Outbound platform API client
pub mod remote;

// Token chain management
pub mod token;

// Content security checks
pub mod security;

// Signatures and the AES envelope
pub mod crypto;

// Platform XML messages and replies
pub mod message;

// Hooks supplied by the embedding application
pub mod host;

// Webhook protocol handling
pub mod webhook;

// Tenant authorization flow
pub mod auth_flow;

// HTTP API
pub mod api;
