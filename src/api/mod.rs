// =============================================================================
// API — operational status surface
// =============================================================================

pub mod rest;
