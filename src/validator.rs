//! Security and structural validation applied while reading a document.
//!
//! Every element name and every attribute/text value passes through the
//! [`ContentValidator`]. Once the document root is found to be an HTML page
//! (a captured error page rather than a protocol message) the hostile
//! content checks are switched off for the rest of the document.

use crate::error::{Violation, ViolationCode};

const SCRIPT_ELEMENT: &str = "script";
const SCRIPT_CONTENT: &str = "javascript";

/// Size and shape limits for inbound documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderLimits {
    pub max_body_size: usize,
    pub max_depth: usize,
    pub max_elements: usize,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_body_size: 5_242_880,
            max_depth: 32,
            max_elements: 10_000,
        }
    }
}

/// Per-document validation state.
#[derive(Debug)]
pub struct ContentValidator {
    limits: ReaderLimits,
    element_count: usize,
    suppressed: bool,
}

impl ContentValidator {
    pub fn new(limits: ReaderLimits) -> Self {
        Self {
            limits,
            element_count: 0,
            suppressed: false,
        }
    }

    /// Switch off hostile-content checks for the rest of the document.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Reject oversized input before any parsing.
    pub fn check_size(&self, len: usize) -> Result<(), Violation> {
        if len > self.limits.max_body_size {
            return Err(Violation::new(
                ViolationCode::BodyTooLarge,
                format!(
                    "Document size {} exceeds maximum {}",
                    len, self.limits.max_body_size
                ),
            ));
        }
        Ok(())
    }

    /// Validate an element as it opens at `depth` (root is depth 1).
    pub fn check_element(&mut self, local_name: &str, depth: usize, path: &str) -> Result<(), Violation> {
        self.element_count += 1;
        if self.suppressed {
            return Ok(());
        }
        if contains_ignore_case(local_name, SCRIPT_ELEMENT) {
            return Err(Violation::with_location(
                ViolationCode::ScriptElement,
                format!("Element name '{local_name}' is not permitted"),
                path,
            ));
        }
        if depth > self.limits.max_depth {
            return Err(Violation::with_location(
                ViolationCode::DepthExceeded,
                format!(
                    "Nesting depth {} exceeds maximum {}",
                    depth, self.limits.max_depth
                ),
                path,
            ));
        }
        if self.element_count > self.limits.max_elements {
            return Err(Violation::with_location(
                ViolationCode::TooManyElements,
                format!(
                    "Document contains more than {} elements",
                    self.limits.max_elements
                ),
                path,
            ));
        }
        Ok(())
    }

    /// Validate an attribute, text or CDATA value.
    pub fn check_value(&self, value: &str, path: &str) -> Result<(), Violation> {
        if !self.suppressed && contains_ignore_case(value, SCRIPT_CONTENT) {
            return Err(Violation::with_location(
                ViolationCode::ScriptContent,
                "Value contains script content",
                path,
            ));
        }
        Ok(())
    }

    /// Validate a DOCTYPE declaration; returns true for an HTML doctype.
    pub fn check_doctype(&self, content: &str) -> Result<bool, Violation> {
        let content = content.trim();
        let is_html = content
            .get(..4)
            .is_some_and(|head| head.eq_ignore_ascii_case("html"));
        if is_html && !content.contains('[') {
            return Ok(true);
        }
        Err(Violation::new(
            ViolationCode::DoctypeDetected,
            "DOCTYPE declarations are not allowed",
        ))
    }

    /// Processing instructions are rejected outright.
    pub fn check_processing_instruction(&self, path: &str) -> Result<(), Violation> {
        if self.suppressed {
            return Ok(());
        }
        Err(Violation::with_location(
            ViolationCode::ProcessingInstructionDetected,
            "Processing instructions are not allowed",
            path,
        ))
    }
}

/// Case-insensitive ASCII substring test.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}
