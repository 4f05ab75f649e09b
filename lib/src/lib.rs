#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown
)]
pub mod arena;
pub mod bodies;
pub mod burn;
pub mod config;
pub mod destination;
pub mod host;
pub mod kepler;
pub mod loader;
pub mod math;
pub mod model;
pub mod route;
pub mod sim;
pub mod time;
pub mod transfer;
pub mod transient;
pub mod vessel;
pub mod watch;
