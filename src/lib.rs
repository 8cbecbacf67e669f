//! # commit-judge: incremental LLM evaluation of contributor history
//!
//! Scores a contributor's commits by sending them, in bounded chunks, to an
//! LLM judge and merging the chunk verdicts into one stable score set.
//! Results are cached and extended incrementally as new commits arrive.
//!
//! ## Architecture
//!
//! - **[`planner`]** - Splits commit history into count/byte bounded chunks
//! - **[`engine`]** - Sequential and bounded-parallel chunk execution, merge with fallback
//! - **[`evaluator`]** - Cached, incremental evaluation service
//! - **[`aliases`]** - Commit-weighted merge of several identities of one person
//! - **[`trajectory`]** - Period accumulation and append-only growth checkpoints
//! - **[`db`]** - SQLite evaluation cache
//! - **[`judge`]** - Judge trait, OpenRouter client and deterministic mock
//! - **[`rubric`]** - Scoring dimensions and prompts per plugin
//! - **[`source`]** - Commit sources and repository url parsing
//! - **[`config`]** - Configuration loading and validation

pub mod aliases;
pub mod config;
pub mod db;
pub mod engine;
pub mod evaluator;
pub mod judge;
pub mod locks;
pub mod model;
pub mod planner;
pub mod rubric;
pub mod source;
pub mod trajectory;
