use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

struct Harness {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut h = Harness {
            _child: child,
            stdin,
            reader,
            next_id: 1,
        };
        let _ = h.call_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        h
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.call(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn create_course(&mut self, name: &str, department: Option<&str>) -> String {
        let mut params = json!({ "name": name });
        if let Some(dept) = department {
            params["department"] = json!(dept);
        }
        self.call_ok("courses.create", params)["courseId"]
            .as_str()
            .expect("courseId")
            .to_string()
    }

    fn create_enrolled(&mut self, course_id: &str, username: &str, name: &str) -> String {
        let student_id = self.call_ok(
            "users.create",
            json!({ "username": username, "name": name }),
        )["userId"]
            .as_str()
            .expect("userId")
            .to_string();
        self.enroll(course_id, &student_id);
        student_id
    }

    fn enroll(&mut self, course_id: &str, student_id: &str) {
        let _ = self.call_ok(
            "enrollments.set",
            json!({ "courseId": course_id, "studentId": student_id, "status": "active" }),
        );
    }

    /// Direct total on a scheme-less course.
    fn upsert_total(&mut self, course_id: &str, student_id: &str, total: f64) {
        let _ = self.call_ok(
            "grades.upsert",
            json!({ "courseId": course_id, "studentId": student_id, "totalScore": total }),
        );
    }
}

fn flags_of(summary: &serde_json::Value) -> Vec<String> {
    summary["anomalies"]
        .as_array()
        .expect("anomalies")
        .iter()
        .map(|v| v.as_str().expect("flag").to_string())
        .collect()
}

#[test]
fn export_writes_header_and_quotes_fields() {
    let mut h = Harness::new("gradebook-export-quote");
    let course_id = h.create_course("高等数学", None);
    let liu = h.create_enrolled(&course_id, "s2021001", "Liu, An");
    h.upsert_total(&course_id, &liu, 95.5);

    let resp = h.call_ok("grades.exportCsv", json!({ "courseId": course_id }));
    assert_eq!(resp["rowsExported"], json!(1));
    let csv = resp["csv"].as_str().expect("csv");
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("学号,姓名,课程,成绩"));
    // Comma in the name forces RFC-4180 quoting.
    assert_eq!(lines.next(), Some("s2021001,\"Liu, An\",高等数学,95.5"));
    assert_eq!(lines.next(), None);
}

#[test]
fn export_to_path_writes_the_file() {
    let mut h = Harness::new("gradebook-export-file");
    let course_id = h.create_course("大学物理", None);
    let student = h.create_enrolled(&course_id, "s2021002", "张三");
    h.upsert_total(&course_id, &student, 77.0);

    let out = std::env::temp_dir()
        .join(format!(
            "gradebook-export-out-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
        .join("grades.csv");
    let resp = h.call_ok(
        "grades.exportCsv",
        json!({ "courseId": course_id, "outPath": out.to_string_lossy() }),
    );
    assert_eq!(
        resp["outPath"].as_str(),
        Some(out.to_string_lossy().as_ref())
    );
    let written = std::fs::read_to_string(&out).expect("exported file");
    assert_eq!(written, resp["csv"].as_str().expect("csv"));
}

#[test]
fn exported_totals_survive_an_import_cycle() {
    let mut h = Harness::new("gradebook-roundtrip");
    let source = h.create_course("线性代数", None);
    let target = h.create_course("线性代数重修", None);

    let usernames = ["s2021010", "s2021011", "s2021012"];
    let totals = [88.25, 61.5, 100.0];
    for (username, total) in usernames.iter().zip(totals) {
        let student_id = h.create_enrolled(&source, username, username);
        h.enroll(&target, &student_id);
        h.upsert_total(&source, &student_id, total);
    }

    let exported = h.call_ok("grades.exportCsv", json!({ "courseId": source }));
    let csv = exported["csv"].as_str().expect("csv");

    // Re-shape the 4-column export into the two-column entry format.
    let mut text = String::from("学号,成绩\n");
    for line in csv.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        text.push_str(&format!("{},{}\n", fields[0], fields[fields.len() - 1]));
    }

    let imported = h.call_ok(
        "grades.importCsv",
        json!({ "courseId": target, "text": text }),
    );
    assert_eq!(imported["imported"], json!(3));
    assert_eq!(imported["skippedTotal"], json!(0));

    let listed = h.call_ok("grades.listByCourse", json!({ "courseId": target }));
    for record in listed["records"].as_array().expect("records") {
        let username = record["username"].as_str().expect("username");
        let expected = usernames
            .iter()
            .position(|u| *u == username)
            .map(|i| totals[i])
            .expect("known student");
        let got = record["totalScore"].as_f64().expect("total");
        assert!(
            (got - expected).abs() < 0.01,
            "{}: {} vs {}",
            username,
            got,
            expected
        );
    }
}

#[test]
fn over_scale_totals_survive_an_import_cycle() {
    let mut h = Harness::new("gradebook-roundtrip-over100");
    let source = h.create_course("实验班数学", None);
    let target = h.create_course("实验班数学重修", None);
    let student_id = h.create_enrolled(&source, "s2021020", "s2021020");
    h.enroll(&target, &student_id);

    // An overridden weight sum above 1.0 legitimately yields totals above
    // 100; they must survive export and two-column re-import unchanged.
    let _ = h.call_ok(
        "scheme.save",
        json!({
            "courseId": source,
            "components": [
                { "id": "a", "name": "A", "weight": 0.8 },
                { "id": "b", "name": "B", "weight": 0.8 },
            ],
            "acceptWeightWarning": true
        }),
    );
    let upserted = h.call_ok(
        "grades.upsert",
        json!({
            "courseId": source,
            "studentId": student_id,
            "componentScores": [
                { "componentId": "a", "score": 100.0 },
                { "componentId": "b", "score": 100.0 },
            ]
        }),
    );
    assert_eq!(upserted["record"]["totalScore"], json!(160.0));

    let exported = h.call_ok("grades.exportCsv", json!({ "courseId": source }));
    let csv = exported["csv"].as_str().expect("csv");
    let mut text = String::from("学号,成绩\n");
    for line in csv.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        text.push_str(&format!("{},{}\n", fields[0], fields[fields.len() - 1]));
    }

    let imported = h.call_ok(
        "grades.importCsv",
        json!({ "courseId": target, "text": text }),
    );
    assert_eq!(imported["imported"], json!(1));
    let listed = h.call_ok("grades.listByCourse", json!({ "courseId": target }));
    assert_eq!(listed["records"][0]["totalScore"], json!(160.0));
}

#[test]
fn high_excellent_rate_flags_the_course() {
    let mut h = Harness::new("gradebook-report-excellent");
    let course_id = h.create_course("概率论", None);

    // 8 of 10 at or above 90.
    let totals = [92.0, 95.0, 91.0, 90.0, 93.0, 97.0, 94.0, 96.0, 70.0, 55.0];
    for (i, total) in totals.iter().enumerate() {
        let username = format!("s20220{:02}", i);
        let student_id = h.create_enrolled(&course_id, &username, &username);
        h.upsert_total(&course_id, &student_id, *total);
    }

    let summary = h.call_ok("reports.courseSummary", json!({ "courseId": course_id }));
    assert_eq!(summary["recordCount"], json!(10));
    assert_eq!(summary["enrolledCount"], json!(10));
    assert_eq!(summary["excellentRate"], json!("80.0"));
    assert_eq!(summary["passRate"], json!("90.0"));
    assert_eq!(flags_of(&summary), vec!["优秀率偏高"]);
    // Everyone has a single course, so nobody deviates from their own average.
    assert_eq!(
        summary["deviantStudents"].as_array().expect("deviants").len(),
        0
    );
}

#[test]
fn widespread_student_deviation_flags_the_course() {
    let mut h = Harness::new("gradebook-report-deviant");
    let strong = h.create_course("程序设计", None);
    let weak = h.create_course("体育", None);

    // Three students, each 90 in one course and 50 in the other: everyone
    // sits 20 points off their own 70 average, in both courses.
    for i in 0..3 {
        let username = format!("s20230{:02}", i);
        let student_id = h.create_enrolled(&strong, &username, &username);
        h.enroll(&weak, &student_id);
        h.upsert_total(&strong, &student_id, 90.0);
        h.upsert_total(&weak, &student_id, 50.0);
    }

    let summary = h.call_ok("reports.courseSummary", json!({ "courseId": strong }));
    let deviants = summary["deviantStudents"].as_array().expect("deviants");
    assert_eq!(deviants.len(), 3);
    assert_eq!(deviants[0]["courseScore"], json!(90.0));
    assert_eq!(deviants[0]["overallAverage"], json!(70.0));
    assert_eq!(deviants[0]["deviation"], json!(20.0));
    assert!(flags_of(&summary).contains(&"学生成绩异常".to_string()));

    let weak_summary = h.call_ok("reports.courseSummary", json!({ "courseId": weak }));
    let weak_flags = flags_of(&weak_summary);
    assert!(weak_flags.contains(&"学生成绩异常".to_string()));
    assert!(weak_flags.contains(&"及格率偏低".to_string()));
}

#[test]
fn empty_course_summary_has_no_flags() {
    let mut h = Harness::new("gradebook-report-empty");
    let course_id = h.create_course("新开课程", None);

    let summary = h.call_ok("reports.courseSummary", json!({ "courseId": course_id }));
    assert_eq!(summary["recordCount"], json!(0));
    assert_eq!(summary["average"], json!(0.0));
    assert!(flags_of(&summary).is_empty());

    let missing = h.call("reports.courseSummary", json!({ "courseId": "nope" }));
    assert_eq!(missing["ok"], json!(false));
    assert_eq!(missing["error"]["code"], json!("not_found"));
}

#[test]
fn department_summary_combines_courses() {
    let mut h = Harness::new("gradebook-report-dept");
    let algo = h.create_course("算法设计", Some("计算机"));
    let arch = h.create_course("体系结构", Some("计算机"));
    let other = h.create_course("有机化学", Some("化学"));

    fn seed(h: &mut Harness, course: &str, prefix: &str, totals: &[f64]) {
        for (i, total) in totals.iter().enumerate() {
            let username = format!("{}{:02}", prefix, i);
            let student_id = h.create_enrolled(course, &username, &username);
            h.upsert_total(course, &student_id, *total);
        }
    }
    seed(&mut h, &algo, "sa", &[80.0, 90.0]);
    seed(&mut h, &arch, "sb", &[40.0]);
    seed(&mut h, &other, "sc", &[100.0]);

    let summary = h.call_ok(
        "reports.departmentSummary",
        json!({ "department": "计算机" }),
    );
    assert_eq!(summary["courseCount"], json!(2));
    assert_eq!(summary["recordCount"], json!(3));
    // Combined over [80, 90, 40]: average 70, pass rate 2/3.
    assert_eq!(summary["average"], json!(70.0));
    assert_eq!(summary["passRate"], json!("66.7"));
    // Only the all-failing course trips a flag.
    assert_eq!(summary["flaggedCourses"], json!(1));
    assert_eq!(summary["courses"].as_array().expect("courses").len(), 2);
}
