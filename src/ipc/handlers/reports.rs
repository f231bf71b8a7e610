use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

struct CourseRecordRow {
    student_id: String,
    username: String,
    total_score: f64,
}

/// Anomaly pass for one course: rate-based flags from the record set, plus
/// per-student deviation against each student's own cross-course average.
fn build_course_summary(
    conn: &Connection,
    course_id: &str,
    course_name: &str,
) -> rusqlite::Result<serde_json::Value> {
    let mut stmt = conn.prepare(
        "SELECT gr.student_id, u.username, gr.total_score
         FROM grade_records gr
         JOIN users u ON u.id = gr.student_id
         WHERE gr.course_id = ?
         ORDER BY u.username",
    )?;
    let records = stmt
        .query_map([course_id], |r| {
            Ok(CourseRecordRow {
                student_id: r.get(0)?,
                username: r.get(1)?,
                total_score: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let enrolled_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE course_id = ? AND status = 'active'",
        [course_id],
        |r| r.get(0),
    )?;

    let mut overall_avg: HashMap<String, f64> = HashMap::new();
    if !records.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(records.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT student_id, AVG(total_score)
             FROM grade_records
             WHERE student_id IN ({})
             GROUP BY student_id",
            placeholders
        );
        let bind: Vec<Value> = records
            .iter()
            .map(|r| Value::Text(r.student_id.clone()))
            .collect();
        let mut avg_stmt = conn.prepare(&sql)?;
        let avgs = avg_stmt
            .query_map(params_from_iter(bind), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        overall_avg.extend(avgs);
    }

    let mut deviant_students: Vec<serde_json::Value> = Vec::new();
    for rec in &records {
        let Some(avg) = overall_avg.get(&rec.student_id) else {
            continue;
        };
        if calc::is_deviant_score(rec.total_score, *avg) {
            deviant_students.push(json!({
                "studentId": rec.student_id,
                "username": rec.username,
                "courseScore": rec.total_score,
                "overallAverage": calc::round_half_up_2(*avg),
                "deviation": calc::round_half_up_2((rec.total_score - avg).abs()),
            }));
        }
    }

    let totals: Vec<f64> = records.iter().map(|r| r.total_score).collect();
    let stats = calc::course_stats(&totals);
    let flags = calc::course_flags(&stats, deviant_students.len(), enrolled_count as usize);

    Ok(json!({
        "courseId": course_id,
        "courseName": course_name,
        "recordCount": stats.count,
        "enrolledCount": enrolled_count,
        "average": stats.average,
        "stdDev": stats.std_dev,
        "excellentRate": calc::format_rate(stats.excellent_rate),
        "passRate": calc::format_rate(stats.pass_rate),
        "anomalies": flags,
        "deviantStudents": deviant_students,
    }))
}

fn handle_course_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
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

    match build_course_summary(conn, &course_id, &course_name) {
        Ok(summary) => ok(&req.id, summary),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_department_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let department = match required_str(req, "department") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn
        .prepare("SELECT id, name FROM courses WHERE department = ? ORDER BY name, id")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let courses = match stmt
        .query_map([&department], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut course_summaries: Vec<serde_json::Value> = Vec::with_capacity(courses.len());
    let mut all_totals: Vec<f64> = Vec::new();
    let mut flagged_courses = 0usize;
    for (course_id, course_name) in &courses {
        let summary = match build_course_summary(conn, course_id, course_name) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if summary
            .get("anomalies")
            .and_then(|v| v.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false)
        {
            flagged_courses += 1;
        }
        course_summaries.push(summary);

        let mut totals_stmt = match conn
            .prepare("SELECT total_score FROM grade_records WHERE course_id = ?")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let totals = match totals_stmt
            .query_map([course_id], |r| r.get::<_, f64>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        all_totals.extend(totals);
    }

    let combined = calc::course_stats(&all_totals);
    ok(
        &req.id,
        json!({
            "department": department,
            "courseCount": courses.len(),
            "recordCount": combined.count,
            "average": combined.average,
            "stdDev": combined.std_dev,
            "excellentRate": calc::format_rate(combined.excellent_rate),
            "passRate": calc::format_rate(combined.pass_rate),
            "flaggedCourses": flagged_courses,
            "courses": course_summaries,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.courseSummary" => Some(handle_course_summary(state, req)),
        "reports.departmentSummary" => Some(handle_department_summary(state, req)),
        _ => None,
    }
}
