//! Tabular previews for query expressions.

use std::fmt;

use quarry_core::error::Result;

use crate::expression::QueryExpression;
use crate::table::Table;

/// Renders the first `limit` rows as a padded text table, truncating long
/// cells to `width` characters. One extra row is fetched to detect and
/// mark truncation.
pub fn preview(expr: &QueryExpression, limit: usize, width: usize) -> Result<String> {
    let sample = expr.restrict(crate::condition::Top {
        limit: Some(limit as u64 + 1),
        order_by: Some(vec!["KEY".to_string()]),
        offset: 0,
    })?;
    let mut rows = sample.fetch()?;
    let truncated = rows.len() > limit;
    rows.truncate(limit);

    let names = expr.heading().names();
    let primary_key = expr.heading().primary_key();
    let cell = |text: String| {
        if text.len() > width {
            format!("{}...", &text[..width.saturating_sub(3)])
        } else {
            text
        }
    };

    let mut columns: Vec<Vec<String>> = Vec::with_capacity(names.len());
    for name in &names {
        let header = if primary_key.contains(name) {
            format!("*{name}")
        } else {
            name.clone()
        };
        let mut column = vec![cell(header)];
        for row in &rows {
            let text = row.get(name).map(|v| v.to_string()).unwrap_or_default();
            column.push(cell(text));
        }
        columns.push(column);
    }
    let widths: Vec<usize> = columns
        .iter()
        .map(|col| col.iter().map(String::len).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for line in 0..=rows.len() {
        for (col, w) in columns.iter().zip(&widths) {
            out.push_str(&format!("{:<width$}  ", col[line], width = *w));
        }
        out.push('\n');
        if line == 0 {
            for w in &widths {
                out.push_str(&format!("{:-<width$}  ", "", width = *w));
            }
            out.push('\n');
        }
    }
    if truncated {
        out.push_str("...\n");
    }
    out.push_str(&format!("({} of {} shown)\n", rows.len(), expr.count()?));
    Ok(out)
}

impl fmt::Display for QueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let display = self.connection().config().display.clone();
        match preview(self, display.limit, display.width) {
            Ok(text) => f.write_str(&text),
            Err(e) => write!(f, "<preview unavailable: {e}>"),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query())
    }
}
