use thiserror::Error;

/// Faults raised while lifting source text or loading an instruction image.
/// Runtime faults live in [`crate::engine::Error`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("`]` with no matching `[` (command {at})")]
    UnmatchedClose { at: usize },
    #[error("{count} unclosed `[` at end of input")]
    UnmatchedOpen { count: usize },
    #[error("invalid instruction image: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("instruction image must be an array or an object of procedures")]
    UnexpectedShape,
    #[error("malformed record in `{procedure}` at slot {slot}")]
    Malformed { procedure: String, slot: usize },
    #[error("procedure `{enclosing}` refers to unknown procedure `{name}`")]
    DanglingRef { enclosing: String, name: String },
    #[error("image has no `main` procedure")]
    MissingMain,
    #[error("procedure `{0}` defined twice")]
    DuplicateProcedure(String),
    #[error("expected `[` to open the body of procedure `{0}`")]
    ExpectedBody(String),
    #[error("body of procedure `{0}` is not closed")]
    UnterminatedBody(String),
    #[error("code outside any procedure definition (command {at})")]
    StrayCode { at: usize },
}
