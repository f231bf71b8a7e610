use crate::calc::{self, ComponentScore};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::scheme::{course_exists, load_scheme};

const LIST_MAX_LIMIT: i64 = 500;
const LIST_DEFAULT_LIMIT: i64 = 200;
const SAVE_ALL_MAX_ENTRIES: usize = 2000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub(crate) struct UpsertOutcome {
    pub record_id: String,
    pub total_score: f64,
    pub created: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Upsert keyed on (course, student): replace the component scores and store
/// the freshly derived total. Callers clamp scores and pick the total source
/// (scheme-derived, or explicit when the scheme is empty) before calling.
pub(crate) fn apply_upsert(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
    scores: &[ComponentScore],
    total_score: f64,
) -> rusqlite::Result<UpsertOutcome> {
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, created_at FROM grade_records WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let now = db::now_iso();
    let (record_id, created, created_at) = match existing {
        Some((id, created_at)) => {
            conn.execute(
                "UPDATE grade_records SET total_score = ?, updated_at = ? WHERE id = ?",
                (total_score, &now, &id),
            )?;
            conn.execute("DELETE FROM component_scores WHERE record_id = ?", [&id])?;
            (id, false, created_at)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO grade_records(id, course_id, student_id, total_score, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&id, course_id, student_id, total_score, &now, &now),
            )?;
            (id, true, now.clone())
        }
    };

    for s in scores {
        conn.execute(
            "INSERT INTO component_scores(record_id, component_id, score)
             VALUES(?, ?, ?)
             ON CONFLICT(record_id, component_id) DO UPDATE SET score = excluded.score",
            (&record_id, &s.component_id, s.score),
        )?;
    }

    Ok(UpsertOutcome {
        record_id,
        total_score,
        created,
        created_at,
        updated_at: now,
    })
}

/// Active-enrollment gate: only actively enrolled students are gradable.
fn check_enrollment(
    conn: &Connection,
    course_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM enrollments WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    match status.as_deref() {
        Some("active") => Ok(()),
        Some(other) => Err(HandlerErr {
            code: "not_enrolled",
            message: "student enrollment is not active".to_string(),
            details: Some(json!({ "status": other })),
        }),
        None => Err(HandlerErr {
            code: "not_enrolled",
            message: "student is not enrolled in this course".to_string(),
            details: None,
        }),
    }
}

fn parse_component_scores(raw: Option<&serde_json::Value>) -> Result<Vec<ComponentScore>, String> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut scores: Vec<ComponentScore> = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(format!("componentScores[{}] must be an object", i));
        };
        let Some(component_id) = obj.get("componentId").and_then(|v| v.as_str()) else {
            return Err(format!("componentScores[{}] missing componentId", i));
        };
        let value = obj.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let clamped = calc::clamp_component_score(value);
        // Last write wins on a duplicate component id.
        if let Some(existing) = scores
            .iter_mut()
            .find(|s| s.component_id == component_id)
        {
            existing.score = clamped;
        } else {
            scores.push(ComponentScore {
                component_id: component_id.to_string(),
                score: clamped,
            });
        }
    }
    Ok(scores)
}

struct UpsertArgs {
    student_id: String,
    scores: Vec<ComponentScore>,
    explicit_total: Option<f64>,
}

fn upsert_one(
    conn: &Connection,
    course_id: &str,
    scheme: &[calc::SchemeComponent],
    args: &UpsertArgs,
) -> Result<UpsertOutcome, HandlerErr> {
    let student_exists: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE id = ?",
            [&args.student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if student_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": args.student_id })),
        });
    }

    check_enrollment(conn, course_id, &args.student_id)?;

    // With a scheme in place the total is always derived; a direct total is
    // only meaningful for scheme-less courses (the two-column import shape)
    // and is stored as given. Overridden weight sums make totals above 100
    // legitimate, so only component scores are clamped.
    let total = if scheme.is_empty() {
        calc::round_half_up_2(args.explicit_total.unwrap_or(0.0))
    } else {
        calc::compute_total(&args.scores, scheme)
    };

    apply_upsert(conn, course_id, &args.student_id, &args.scores, total).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let scheme = match load_scheme(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scores = match parse_component_scores(req.params.get("componentScores")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let explicit_total = req.params.get("totalScore").and_then(|v| v.as_f64());

    let args = UpsertArgs {
        student_id,
        scores,
        explicit_total,
    };
    let outcome = match upsert_one(conn, &course_id, &scheme, &args) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    ok(
        &req.id,
        json!({
            "record": {
                "id": outcome.record_id,
                "courseId": course_id,
                "studentId": args.student_id,
                "componentScores": args.scores,
                "totalScore": outcome.total_score,
                "createdAt": outcome.created_at,
                "updatedAt": outcome.updated_at,
            },
            "created": outcome.created
        }),
    )
}

fn handle_grades_save_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };
    if entries.len() > SAVE_ALL_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            "batch payload is too large",
            Some(json!({
                "entries": entries.len(),
                "maxEntries": SAVE_ALL_MAX_ENTRIES
            })),
        );
    }

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let scheme = match load_scheme(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut saved = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} must be an object", i),
            }));
            continue;
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} missing studentId", i),
            }));
            continue;
        };
        let scores = match parse_component_scores(obj.get("componentScores")) {
            Ok(v) => v,
            Err(msg) => {
                errors.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "code": "bad_params",
                    "message": msg,
                }));
                continue;
            }
        };
        let args = UpsertArgs {
            student_id: student_id.to_string(),
            scores,
            explicit_total: obj.get("totalScore").and_then(|v| v.as_f64()),
        };
        match upsert_one(&tx, &course_id, &scheme, &args) {
            Ok(_) => saved += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let rejected = errors.len();
    let mut result = json!({
        "saved": saved,
        "summary": format!("saved {}, rejected {}", saved, rejected),
    });
    if rejected > 0 {
        result["rejected"] = json!(rejected);
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_grades_list_by_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(LIST_DEFAULT_LIMIT);
    let offset = req
        .params
        .get("offset")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if limit < 0 || offset < 0 {
        return err(&req.id, "bad_params", "limit/offset must be >= 0", None);
    }
    if limit > LIST_MAX_LIMIT {
        return err(
            &req.id,
            "bad_params",
            "requested page is too large",
            Some(json!({ "limit": limit, "maxLimit": LIST_MAX_LIMIT })),
        );
    }

    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let total: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM grade_records WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT gr.id, gr.student_id, u.username, u.name, gr.total_score,
                gr.created_at, gr.updated_at
         FROM grade_records gr
         JOIN users u ON u.id = gr.student_id
         WHERE gr.course_id = ?
         ORDER BY u.username
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map((&course_id, limit, offset), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut scores_stmt = match conn
        .prepare("SELECT component_id, score FROM component_scores WHERE record_id = ?")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut records: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    for (id, student_id, username, name, total_score, created_at, updated_at) in rows {
        let scores = match scores_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "componentId": r.get::<_, String>(0)?,
                    "score": r.get::<_, f64>(1)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        records.push(json!({
            "id": id,
            "courseId": course_id,
            "studentId": student_id,
            "username": username,
            "studentName": name,
            "componentScores": scores,
            "totalScore": total_score,
            "createdAt": created_at,
            "updatedAt": updated_at,
        }));
    }

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "total": total,
            "offset": offset,
            "records": records
        }),
    )
}

fn handle_grades_delete_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM component_scores WHERE record_id IN
            (SELECT id FROM grade_records WHERE student_id = ?)",
        [&student_id],
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    let deleted = match tx.execute("DELETE FROM grade_records WHERE student_id = ?", [&student_id])
    {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "recordsDeleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.saveAll" => Some(handle_grades_save_all(state, req)),
        "grades.listByCourse" => Some(handle_grades_list_by_course(state, req)),
        "grades.deleteByStudent" => Some(handle_grades_delete_by_student(state, req)),
        _ => None,
    }
}
