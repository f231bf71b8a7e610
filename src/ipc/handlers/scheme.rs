use crate::calc::{self, SchemeComponent};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

/// UI bootstrap default when a course has no saved scheme. Never persisted
/// until the teacher explicitly saves it.
const DEFAULT_SCHEME: [(&str, f64); 3] = [("平时", 0.3), ("期中", 0.3), ("期末", 0.4)];

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub(crate) fn course_exists(conn: &Connection, course_id: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM courses WHERE id = ?", [course_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Persisted scheme in definition order. Empty when the course has never had
/// a scheme saved.
pub(crate) fn load_scheme(
    conn: &Connection,
    course_id: &str,
) -> rusqlite::Result<Vec<SchemeComponent>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, weight FROM grade_components
         WHERE course_id = ?
         ORDER BY sort_order",
    )?;
    let components = stmt
        .query_map([course_id], |r| {
            Ok(SchemeComponent {
                id: r.get(0)?,
                name: r.get(1)?,
                weight: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(components)
}

fn components_json(components: &[SchemeComponent]) -> Vec<serde_json::Value> {
    components
        .iter()
        .map(|c| json!({ "id": c.id, "name": c.name, "weight": c.weight }))
        .collect()
}

fn handle_scheme_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let persisted = match load_scheme(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if persisted.is_empty() {
        let defaults: Vec<SchemeComponent> = DEFAULT_SCHEME
            .iter()
            .map(|(name, weight)| SchemeComponent {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                weight: *weight,
            })
            .collect();
        return ok(
            &req.id,
            json!({
                "courseId": course_id,
                "components": components_json(&defaults),
                "isDefault": true
            }),
        );
    }

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "components": components_json(&persisted),
            "isDefault": false
        }),
    )
}

fn parse_components(req: &Request) -> Result<Vec<SchemeComponent>, serde_json::Value> {
    let Some(arr) = req.params.get("components").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing components[]", None));
    };

    let mut components = Vec::with_capacity(arr.len());
    let mut seen_names: HashSet<String> = HashSet::new();
    for (i, item) in arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("component at index {} must be an object", i),
                None,
            ));
        };
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(name) = name else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("component at index {} missing name", i),
                None,
            ));
        };
        if !seen_names.insert(name.clone()) {
            return Err(err(
                &req.id,
                "bad_params",
                "duplicate component name",
                Some(json!({ "name": name })),
            ));
        }
        let weight = obj.get("weight").and_then(|v| v.as_f64());
        let Some(weight) = weight else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("component at index {} missing numeric weight", i),
                None,
            ));
        };
        if !weight.is_finite() || weight < 0.0 {
            return Err(err(
                &req.id,
                "bad_params",
                "component weight must be a non-negative number",
                Some(json!({ "name": name, "weight": weight })),
            ));
        }
        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        components.push(SchemeComponent { id, name, weight });
    }
    Ok(components)
}

fn handle_scheme_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match course_exists(conn, &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let components = match parse_components(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Warning-level check: an off sum never blocks a save once the caller
    // explicitly accepts it.
    let accept_weight_warning = req
        .params
        .get("acceptWeightWarning")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let weight_sum = calc::check_weight_sum(&components);
    if let Some(sum) = weight_sum {
        if !accept_weight_warning {
            return err(
                &req.id,
                "weight_sum_warning",
                format!("component weights sum to {:.3}, not 1.0", sum),
                Some(json!({ "sum": sum })),
            );
        }
    }

    let old_scheme = match load_scheme(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let new_ids: HashSet<&str> = components.iter().map(|c| c.id.as_str()).collect();
    let removed_ids: Vec<String> = old_scheme
        .iter()
        .filter(|c| !new_ids.contains(c.id.as_str()))
        .map(|c| c.id.clone())
        .collect();

    let mut affected_records = 0i64;
    if !removed_ids.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(removed_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT COUNT(DISTINCT cs.record_id)
             FROM component_scores cs
             JOIN grade_records gr ON gr.id = cs.record_id
             WHERE gr.course_id = ? AND cs.component_id IN ({})",
            placeholders
        );
        let mut bind: Vec<Value> = Vec::with_capacity(removed_ids.len() + 1);
        bind.push(Value::Text(course_id.clone()));
        for id in &removed_ids {
            bind.push(Value::Text(id.clone()));
        }
        affected_records = match conn.query_row(&sql, params_from_iter(bind), |r| r.get(0)) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    }

    // Stripping scores off existing records is a user decision, never
    // automatic.
    let cascade = req.params.get("cascade").and_then(|v| v.as_bool());
    if affected_records > 0 && cascade.is_none() {
        return err(
            &req.id,
            "cascade_confirmation_required",
            "removed components have recorded scores; confirm cascade",
            Some(json!({
                "removedComponentIds": removed_ids,
                "affectedRecords": affected_records
            })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM grade_components WHERE course_id = ?",
        [&course_id],
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    for (i, c) in components.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO grade_components(id, course_id, name, weight, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            (&c.id, &course_id, &c.name, c.weight, i as i64),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    let mut recomputed = 0usize;
    if cascade == Some(true) && !removed_ids.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(removed_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "DELETE FROM component_scores
             WHERE component_id IN ({})
               AND record_id IN (SELECT id FROM grade_records WHERE course_id = ?)",
            placeholders
        );
        let mut bind: Vec<Value> = Vec::with_capacity(removed_ids.len() + 1);
        for id in &removed_ids {
            bind.push(Value::Text(id.clone()));
        }
        bind.push(Value::Text(course_id.clone()));
        if let Err(e) = tx.execute(&sql, params_from_iter(bind)) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }

        // Recompute every record against the new scheme. Weights are used
        // as stored; removing a component does not renormalize the rest.
        match recompute_course_totals(&tx, &course_id, &components) {
            Ok(n) => recomputed = n,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let mut result = json!({
        "courseId": course_id,
        "components": components_json(&components),
        "cascaded": cascade == Some(true) && !removed_ids.is_empty(),
        "recomputedRecords": recomputed,
    });
    if let Some(sum) = weight_sum {
        result["weightWarning"] = json!({ "sum": sum });
    }
    ok(&req.id, result)
}

fn recompute_course_totals(
    conn: &Connection,
    course_id: &str,
    scheme: &[SchemeComponent],
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("SELECT id FROM grade_records WHERE course_id = ?")?;
    let record_ids = stmt
        .query_map([course_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut scores_stmt =
        conn.prepare("SELECT component_id, score FROM component_scores WHERE record_id = ?")?;
    let now = db::now_iso();
    let mut updated = 0usize;
    for record_id in record_ids {
        let scores = scores_stmt
            .query_map([&record_id], |r| {
                Ok(calc::ComponentScore {
                    component_id: r.get(0)?,
                    score: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let total = calc::compute_total(&scores, scheme);
        conn.execute(
            "UPDATE grade_records SET total_score = ?, updated_at = ? WHERE id = ?",
            (total, &now, &record_id),
        )?;
        updated += 1;
    }
    Ok(updated)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scheme.get" => Some(handle_scheme_get(state, req)),
        "scheme.save" => Some(handle_scheme_save(state, req)),
        _ => None,
    }
}
