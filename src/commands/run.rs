//! Run and explain commands

use crate::ast::Statement;
use crate::engine::{Engine, StatementOutcome};
use crate::error::{Error, Result};
use crate::exec::operators::batch_to_json;
use crate::kb::WriteSummary;
use crate::progress::statement_spinner;
use crate::value::Batch;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::io::Read;
use std::path::Path;

/// Result of one statement, as printed or serialized
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StatementReport {
    Rows {
        columns: Vec<String>,
        rows: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        write_summary: Option<WriteSummary>,
        #[serde(skip)]
        table: Vec<Vec<String>>,
    },
    Created {
        kind: String,
        name: String,
    },
    Dropped {
        kind: String,
        name: String,
        existed: bool,
    },
    Deleted {
        rows: usize,
    },
}

impl From<StatementOutcome> for StatementReport {
    fn from(outcome: StatementOutcome) -> Self {
        match outcome {
            StatementOutcome::Rows(stream) => {
                let write_summary = stream.write_summary().cloned();
                let batch = stream.into_batch();
                StatementReport::Rows {
                    columns: batch.schema.fields.iter().map(|f| f.name.clone()).collect(),
                    rows: batch_to_json(&batch),
                    table: render_cells(&batch),
                    write_summary,
                }
            }
            StatementOutcome::Created { kind, name } => StatementReport::Created {
                kind: kind.to_string(),
                name,
            },
            StatementOutcome::Dropped { kind, name, existed } => StatementReport::Dropped {
                kind: kind.to_string(),
                name,
                existed,
            },
            StatementOutcome::Deleted { rows } => StatementReport::Deleted { rows },
        }
    }
}

fn render_cells(batch: &Batch) -> Vec<Vec<String>> {
    batch
        .rows
        .iter()
        .map(|row| row.iter().map(|v| v.to_string()).collect())
        .collect()
}

/// Read statements from a JSON file, or stdin when `path` is `-`.
/// The document is either one statement or an array of them.
pub fn read_statements(path: &Path) -> Result<Vec<Statement>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    parse_statements(&text)
}

pub fn parse_statements(text: &str) -> Result<Vec<Statement>> {
    let document: JsonValue = serde_json::from_str(text)?;
    let statements = match document {
        JsonValue::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Statement>, _>>()?,
        single => vec![serde_json::from_value(single)?],
    };
    if statements.is_empty() {
        return Err(Error::Config("no statements to run".to_string()));
    }
    Ok(statements)
}

/// Short label for progress output
pub fn describe(statement: &Statement) -> String {
    match statement {
        Statement::Query(_) => "query".to_string(),
        Statement::Insert { target, .. } => format!("insert into {}", target.qualified()),
        Statement::Delete { target, .. } => format!("delete from {}", target.qualified()),
        Statement::CreateKnowledgeBase(kb) => format!("create knowledge base {}", kb.name.qualified()),
        Statement::CreateModel(model) => format!("create model {}", model.name.qualified()),
        Statement::CreateAgent(agent) => format!("create agent {}", agent.name.qualified()),
        Statement::CreateJob(job) => format!("create job {}", job.name.qualified()),
        Statement::CreateView { name, .. } => format!("create view {}", name.qualified()),
        Statement::Drop { kind, name, .. } => format!("drop {} {}", kind, name.qualified()),
    }
}

/// Execute statements in order, stopping at the first failure
pub async fn cmd_run(
    engine: &Engine,
    statements: &[Statement],
    row_limit: Option<usize>,
) -> Result<Vec<StatementReport>> {
    let mut reports = Vec::with_capacity(statements.len());
    for statement in statements {
        let spinner = statement_spinner(&describe(statement));
        let outcome = engine.execute(statement, row_limit).await;
        spinner.finish_and_clear();
        reports.push(outcome?.into());
    }
    Ok(reports)
}

/// Plans of the plannable statements, rendered as text
pub async fn cmd_explain(engine: &Engine, statements: &[Statement]) -> Result<Vec<String>> {
    let mut plans = Vec::with_capacity(statements.len());
    for statement in statements {
        plans.push(engine.explain(statement).await?.to_string());
    }
    Ok(plans)
}

pub fn print_report(report: &StatementReport) {
    match report {
        StatementReport::Rows {
            columns,
            table,
            write_summary,
            ..
        } => {
            match write_summary {
                Some(summary) => print_write_summary(summary),
                None => print_table(columns, table),
            }
        }
        StatementReport::Created { kind, name } => println!("✓ Created {} {}", kind, name),
        StatementReport::Dropped { kind, name, existed } => {
            if *existed {
                println!("✓ Dropped {} {}", kind, name);
            } else {
                println!("{} {} did not exist", kind, name);
            }
        }
        StatementReport::Deleted { rows } => println!("✓ Deleted {} rows", rows),
    }
}

fn print_write_summary(summary: &WriteSummary) {
    println!(
        "✓ Wrote {} rows ({} unchanged, {} failed)",
        summary.inserted,
        summary.unchanged,
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!("  ✗ {}: {}", failure.row_id, failure.reason);
    }
}

fn print_table(columns: &[String], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
    };

    println!("{}", line(columns));
    println!(
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );
    for row in rows {
        println!("{}", line(row));
    }
    println!("({} rows)", rows.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_array() {
        let one = r#"{"drop": {"kind": "view", "name": "v", "if_exists": true}}"#;
        assert_eq!(parse_statements(one).unwrap().len(), 1);

        let many = format!("[{}, {}]", one, one);
        let statements = parse_statements(&many).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(describe(&statements[0]), "drop view v");
    }

    #[test]
    fn test_parse_rejects_empty_array() {
        assert!(parse_statements("[]").is_err());
        assert!(parse_statements("{\"bogus\": 1}").is_err());
    }
}
