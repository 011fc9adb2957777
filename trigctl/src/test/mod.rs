//! Cross-component test suites.
