use crate::calc::{self, ComponentScore};
use crate::csvio;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use super::grades::apply_upsert;
use super::scheme::load_scheme;

/// Skipped-row detail returned to the caller is capped; the full count still
/// travels in `skippedTotal`.
const SKIPPED_DETAIL_MAX: usize = 50;

struct ParsedImportRow {
    student_id: String,
    scores: Vec<ComponentScore>,
    explicit_total: Option<f64>,
}

fn handle_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let Some(text) = req.params.get("text").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing text", None);
    };

    let course_name: Option<String> = match conn
        .query_row("SELECT name FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_name.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let scheme = match load_scheme(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let text = csvio::strip_bom(text);
    let mut lines = text.lines();
    let Some(header_line) = lines.next() else {
        return err(&req.id, "bad_params", "file is empty, header row required", None);
    };
    let delim = csvio::detect_delimiter(header_line);

    // Active roster lookup: username first, user id as a fallback.
    let mut roster_stmt = match conn.prepare(
        "SELECT u.id, u.username
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.course_id = ? AND e.status = 'active'",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match roster_stmt
        .query_map([&course_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut by_username: HashMap<&str, &str> = HashMap::new();
    let mut id_set: HashSet<&str> = HashSet::new();
    for (id, username) in &roster {
        by_username.insert(username.as_str(), id.as_str());
        id_set.insert(id.as_str());
    }

    let mut rows: Vec<ParsedImportRow> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        if line_no == 0 {
            continue;
        }
        if raw_line.trim().is_empty() {
            continue;
        }
        // Rows report 1-based file line numbers: data row 1 is file row 2.
        let file_row = line_no + 1;

        // Parse the raw line; trimming it first would eat delimiter
        // characters at the edges and shift every column. Fields are
        // trimmed individually below.
        let fields = csvio::parse_record(raw_line, delim);
        let key = fields[0].trim();
        if key.is_empty() {
            skipped.push(json!({ "row": file_row, "reason": "missing student key" }));
            continue;
        }

        let student_id = match by_username.get(key) {
            Some(id) => (*id).to_string(),
            None if id_set.contains(key) => key.to_string(),
            None => {
                skipped.push(json!({ "row": file_row, "reason": "unmatched student" }));
                continue;
            }
        };

        if scheme.is_empty() {
            // Two-column shape: the value is stored directly as the total.
            // Overridden weight sums legitimately produce totals outside
            // [0, 100], so no clamp here.
            let value = fields
                .get(1)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(0.0);
            rows.push(ParsedImportRow {
                student_id,
                scores: Vec::new(),
                explicit_total: Some(value),
            });
        } else {
            // Multi-column shape: columns map positionally onto the scheme;
            // unparseable or missing values default to 0.
            let scores: Vec<ComponentScore> = scheme
                .iter()
                .enumerate()
                .map(|(i, component)| {
                    let value = fields
                        .get(1 + i)
                        .map(|s| s.trim().parse::<f64>().unwrap_or(0.0))
                        .unwrap_or(0.0);
                    ComponentScore {
                        component_id: component.id.clone(),
                        score: calc::clamp_component_score(value),
                    }
                })
                .collect();
            rows.push(ParsedImportRow {
                student_id,
                scores,
                explicit_total: None,
            });
        }
    }

    // One pass, one transaction: the caller never observes a half-applied
    // import.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut imported = 0usize;
    for row in &rows {
        let total = match row.explicit_total {
            Some(v) => calc::round_half_up_2(v),
            None => calc::compute_total(&row.scores, &scheme),
        };
        if let Err(e) = apply_upsert(&tx, &course_id, &row.student_id, &row.scores, total) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        imported += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let skipped_total = skipped.len();
    skipped.truncate(SKIPPED_DETAIL_MAX);

    ok(
        &req.id,
        json!({
            "imported": imported,
            "skipped": skipped,
            "skippedTotal": skipped_total,
            "summary": format!("imported {}, skipped {}", imported, skipped_total),
        }),
    )
}

fn handle_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let course_name: Option<String> = match conn
        .query_row("SELECT name FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_name) = course_name else {
        return err(&req.id, "not_found", "course not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT u.username, u.name, gr.total_score
         FROM grade_records gr
         JOIN users u ON u.id = gr.student_id
         WHERE gr.course_id = ?
         ORDER BY u.username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([&course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut csv = String::from("学号,姓名,课程,成绩\n");
    let rows_exported = rows.len();
    for (username, name, total_score) in rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csvio::quote(&username),
            csvio::quote(&name),
            csvio::quote(&course_name),
            total_score
        ));
    }

    let out_path = req
        .params
        .get("outPath")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(out_path) = &out_path {
        let out = PathBuf::from(out_path);
        if let Some(parent) = out.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return err(
                    &req.id,
                    "io_failed",
                    e.to_string(),
                    Some(json!({ "path": out_path })),
                );
            }
        }
        if let Err(e) = std::fs::write(&out, &csv) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }

    let mut result = json!({ "csv": csv, "rowsExported": rows_exported });
    if let Some(out_path) = out_path {
        result["outPath"] = json!(out_path);
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.importCsv" => Some(handle_import_csv(state, req)),
        "grades.exportCsv" => Some(handle_export_csv(state, req)),
        _ => None,
    }
}
