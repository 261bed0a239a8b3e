//! Utility functions for Notekeep Core
//!
//! This module provides common utility functions used across the codebase.

mod markup;

pub use markup::{escape_html, extract_links, markup_to_markdown, strip_markup, word_count};
