//! Human-readable rendering of read-back values
//!
//! ```text
//! "buf": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9,
//!         10, 11]
//! ```

use std::fmt;

/// Elements per line
pub const COLUMNS: usize = 10;

/// Lazy bracketed rendering of a sequence, wrapped every [`COLUMNS`] elements
///
/// The sequence is iterated afresh on every format, so one value can be
/// displayed any number of times.
#[derive(Debug, Clone)]
pub struct RangeDisplay<'a, I> {
    items: I,
    label: Option<&'a str>,
}

impl<'a, I> RangeDisplay<'a, I>
where
    I: IntoIterator + Clone,
    I::Item: fmt::Display,
{
    /// Unlabelled rendering
    pub fn new(items: I) -> Self {
        Self { items, label: None }
    }

    /// Rendering prefixed by `"label": `; an empty label means none
    pub fn labelled(items: I, label: &'a str) -> Self {
        Self {
            items,
            label: Some(label).filter(|label| !label.is_empty()),
        }
    }

    fn indent(&self) -> usize {
        // Aligns continuation lines under the first element
        self.label.map_or(1, |label| label.len() + 5)
    }
}

impl<I> fmt::Display for RangeDisplay<'_, I>
where
    I: IntoIterator + Clone,
    I::Item: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = self.label {
            write!(f, "\"{label}\": ")?;
        }
        f.write_str("[")?;

        let indent = self.indent();
        let mut items = self.items.clone().into_iter().peekable();
        let mut count = 1;
        while let Some(item) = items.next() {
            write!(f, "{item}")?;
            if items.peek().is_some() {
                if count % COLUMNS == 0 {
                    write!(f, ",\n{:indent$}", "")?;
                } else {
                    f.write_str(", ")?;
                }
            }
            count += 1;
        }
        f.write_str("]")
    }
}

/// Render `items`, with an optional label
pub fn render<I>(items: I, label: Option<&str>) -> String
where
    I: IntoIterator + Clone,
    I::Item: fmt::Display,
{
    match label {
        Some(label) => RangeDisplay::labelled(items, label).to_string(),
        None => RangeDisplay::new(items).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_labelled_wraps_after_tenth() {
        assert_eq!(
            render(0..=11, Some("buf")),
            "\"buf\": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9,\n        10, 11]"
        );
    }

    #[test]
    fn test_unlabelled() {
        assert_eq!(render([1, 2, 3], None), "[1, 2, 3]");
        assert_eq!(
            render(0..21, None),
            "[0, 1, 2, 3, 4, 5, 6, 7, 8, 9,\n 10, 11, 12, 13, 14, 15, 16, 17, 18, 19,\n 20]"
        );
    }

    #[test]
    fn test_empty() {
        assert_eq!(render(Vec::<i32>::new(), None), "[]");
        assert_eq!(render(0..0, Some("x")), "\"x\": []");
    }

    #[test]
    fn test_empty_label_is_unlabelled() {
        assert_eq!(render(0..12, Some("")), render(0..12, None));
        assert_eq!(
            RangeDisplay::labelled([1, 2], "").to_string(),
            "[1, 2]"
        );
    }

    #[test]
    fn test_exactly_one_line() {
        // No break when nothing follows the tenth element
        assert_eq!(render(0..10, None), "[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]");
    }

    #[test]
    fn test_restartable() {
        let values = vec![3, 4];
        let display = RangeDisplay::new(&values);
        assert_eq!(display.to_string(), display.to_string());
        assert_eq!(format!("{display}"), "[3, 4]");
    }

    proptest! {
        #[test]
        fn test_line_count(len in 0usize..200) {
            let text = render(0..len, None);
            let lines = text.lines().count();
            let expected = if len == 0 { 1 } else { len.div_ceil(COLUMNS) };
            prop_assert_eq!(lines, expected);
        }

        #[test]
        fn test_elements_survive(values in proptest::collection::vec(any::<i32>(), 0..60)) {
            let text = render(&values, Some("v"));
            let body = text
                .trim_start_matches("\"v\": [")
                .trim_end_matches(']');
            let parsed: Vec<i32> = body
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().unwrap())
                .collect();
            prop_assert_eq!(parsed, values);
        }

        #[test]
        fn test_continuation_indent(label in "[a-z]{0,12}", len in 11usize..40) {
            let text = render(0..len, Some(&label));
            let expected = if label.is_empty() { 1 } else { label.len() + 5 };
            for line in text.lines().skip(1) {
                let indent = line.len() - line.trim_start().len();
                prop_assert_eq!(indent, expected);
            }
        }
    }
}
