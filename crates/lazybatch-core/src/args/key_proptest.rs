//! Property-based tests for cache keys.
