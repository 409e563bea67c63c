//! Parsing of the wrapped CLI's terminal output.
//!
//! Raw chunks flow through [`LineAssembler`], are cleaned by [`strip_ansi`],
//! then routed: stderr lines to [`classify`], banner lines to
//! [`InitializationAggregator`], thinking indicators to
//! [`ThinkingDeduplicator`], and everything else on stdout to
//! [`ParagraphAssembler`], which strips tool markers via [`ToolStreamBuffer`].

pub mod ansi;
pub mod classifier;
pub mod init;
pub mod line_assembler;
pub mod paragraph;
pub mod thinking;
pub mod tools;

pub use ansi::strip_ansi;
pub use classifier::{
    classify, classify_with_rule, is_initialization_complete, is_initialization_message,
    MessageClass,
};
pub use init::InitializationAggregator;
pub use line_assembler::LineAssembler;
pub use paragraph::{should_skip, FlushedParagraph, ParagraphAssembler};
pub use thinking::{
    is_prompt_ready, is_thinking_indicator, ThinkingDecision, ThinkingDeduplicator,
    THINKING_MESSAGE,
};
pub use tools::{detect_tools, ToolDetection, ToolStreamBuffer};
