//! Menu codes understood by the engine's batch interface.
//!
//! Only the codes the workflows actually send are listed. Their meaning
//! depends on the menu the engine is currently in, which is why the workflow
//! builder fixes the order in which they go out.

// Analysis selection.
pub const CCA: i64 = 611;
pub const PCR: i64 = 612;
pub const MLR: i64 = 613;
/// Verification of forecasts that are already on the predictor side.
pub const GCM: i64 = 614;
pub const PFV: i64 = 621;

pub const SYNCHRONOUS_PREDICTORS: i64 = 545;

// Dataset loading; each is followed by the archive path.
pub const OPEN_PREDICTOR: i64 = 1;
pub const OPEN_PREDICTAND: i64 = 2;
pub const OPEN_FORECAST: i64 = 3;

// Settings.
pub const OUTPUT_FORMAT: i64 = 131;
pub const OUTPUT_FORMAT_TEXT: i64 = 2;
pub const SIGNIFICANT_FIGURES: i64 = 132;
pub const GOODNESS_INDEX: i64 = 531;
pub const MISSING_VALUES: i64 = 544;
pub const TRANSFORM_PREDICTAND: i64 = 541;

// Execution.
pub const CROSS_VALIDATE: i64 = 311;
pub const RETROACTIVE: i64 = 312;
pub const VERIFY_PROBABILISTIC: i64 = 313;

// Result export.
pub const DETERMINISTIC_SKILL: i64 = 413;
pub const PROBABILISTIC_SKILL: i64 = 437;
pub const OUTPUT_RESULTS: i64 = 111;
pub const SAVE_X_EOF_LOADINGS: i64 = 302;
pub const SAVE_X_EOF_SCORES: i64 = 303;
pub const SAVE_Y_EOF_LOADINGS: i64 = 312;
pub const SAVE_Y_EOF_SCORES: i64 = 313;
pub const SAVE_CCA_X_LOADINGS: i64 = 401;
pub const SAVE_CCA_Y_LOADINGS: i64 = 411;
pub const SAVE_HINDCASTS: i64 = 201;
pub const SAVE_FORECAST_PROBABILITIES: i64 = 501;
pub const SAVE_FORECAST_VALUES: i64 = 511;
pub const PROBABILISTIC_FORECAST: i64 = 455;
pub const END_OUTPUT: i64 = 0;

/// Chosen from the main menu, ends the engine. Output menus are closed first.
pub const EXIT: i64 = 0;
