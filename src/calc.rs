use serde::{Deserialize, Serialize};

/// Weight sums are a warning-level check, not a hard invariant; the platform
/// lets teachers save schemes that are off after an explicit override.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

pub const EXCELLENT_SCORE: f64 = 90.0;
pub const PASS_SCORE: f64 = 60.0;
pub const EXCELLENT_RATE_HIGH: f64 = 0.7;
pub const PASS_RATE_LOW: f64 = 0.5;
pub const STUDENT_DEVIATION_POINTS: f64 = 20.0;

pub const FLAG_EXCELLENT_RATE_HIGH: &str = "优秀率偏高";
pub const FLAG_PASS_RATE_LOW: &str = "及格率偏低";
pub const FLAG_STUDENT_ANOMALY: &str = "学生成绩异常";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeComponent {
    pub id: String,
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    pub component_id: String,
    pub score: f64,
}

/// Half-up rounding to 2 decimal places:
/// `Int(100*x + 0.5) / 100`
pub fn round_half_up_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Clamp a single component score to the gradable range. Callers apply this
/// before `compute_total`; the calculator itself imposes no bounds.
pub fn clamp_component_score(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Weighted total over the course scheme. Scores are matched to components by
/// id, not position; a component with no matching score contributes 0.
pub fn compute_total(scores: &[ComponentScore], scheme: &[SchemeComponent]) -> f64 {
    let mut total = 0.0_f64;
    for component in scheme {
        let score = scores
            .iter()
            .find(|s| s.component_id == component.id)
            .map(|s| s.score)
            .unwrap_or(0.0);
        total += score * component.weight;
    }
    round_half_up_2(total)
}

/// Returns the actual weight sum when it is off by more than the tolerance.
/// `None` means the scheme passes the check.
pub fn check_weight_sum(scheme: &[SchemeComponent]) -> Option<f64> {
    let sum: f64 = scheme.iter().map(|c| c.weight).sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        Some(sum)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStats {
    pub count: usize,
    pub average: f64,
    pub std_dev: f64,
    /// Fraction of totals >= 90.
    pub excellent_rate: f64,
    /// Fraction of totals >= 60.
    pub pass_rate: f64,
}

pub fn course_stats(totals: &[f64]) -> CourseStats {
    let count = totals.len();
    if count == 0 {
        return CourseStats {
            count: 0,
            average: 0.0,
            std_dev: 0.0,
            excellent_rate: 0.0,
            pass_rate: 0.0,
        };
    }

    let n = count as f64;
    let sum: f64 = totals.iter().sum();
    let average = sum / n;

    // Population standard deviation (divide by N, not N-1).
    let variance = totals.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    let excellent = totals.iter().filter(|v| **v >= EXCELLENT_SCORE).count();
    let pass = totals.iter().filter(|v| **v >= PASS_SCORE).count();

    CourseStats {
        count,
        average: round_half_up_2(average),
        std_dev: round_half_up_2(std_dev),
        excellent_rate: excellent as f64 / n,
        pass_rate: pass as f64 / n,
    }
}

/// One-decimal percentage string, e.g. 0.8 -> "80.0".
pub fn format_rate(fraction: f64) -> String {
    format!("{:.1}", fraction * 100.0)
}

/// Minimum number of deviant students before the course itself is flagged.
pub fn deviant_student_threshold(enrolled_count: usize) -> usize {
    let scaled = (0.3 * enrolled_count as f64).ceil() as usize;
    scaled.max(3)
}

/// A student deviating from their own cross-course average by 20 or more
/// points counts as anomalous within this course.
pub fn is_deviant_score(course_score: f64, student_average: f64) -> bool {
    (course_score - student_average).abs() >= STUDENT_DEVIATION_POINTS
}

/// Course-level anomaly flags. Each flag is independently evaluable and a
/// course can carry several at once. Courses with no graded records carry
/// none.
pub fn course_flags(
    stats: &CourseStats,
    deviant_count: usize,
    enrolled_count: usize,
) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if stats.count == 0 {
        return flags;
    }
    if stats.excellent_rate > EXCELLENT_RATE_HIGH {
        flags.push(FLAG_EXCELLENT_RATE_HIGH);
    }
    if stats.pass_rate < PASS_RATE_LOW {
        flags.push(FLAG_PASS_RATE_LOW);
    }
    if deviant_count >= deviant_student_threshold(enrolled_count) {
        flags.push(FLAG_STUDENT_ANOMALY);
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> Vec<SchemeComponent> {
        vec![
            SchemeComponent {
                id: "c1".to_string(),
                name: "平时".to_string(),
                weight: 0.3,
            },
            SchemeComponent {
                id: "c2".to_string(),
                name: "期中".to_string(),
                weight: 0.3,
            },
            SchemeComponent {
                id: "c3".to_string(),
                name: "期末".to_string(),
                weight: 0.4,
            },
        ]
    }

    fn score(id: &str, v: f64) -> ComponentScore {
        ComponentScore {
            component_id: id.to_string(),
            score: v,
        }
    }

    #[test]
    fn round_half_up_2_basics() {
        assert_eq!(round_half_up_2(0.0), 0.0);
        assert_eq!(round_half_up_2(70.0), 70.0);
        assert_eq!(round_half_up_2(3.544), 3.54);
        assert_eq!(round_half_up_2(3.546), 3.55);
        assert_eq!(round_half_up_2(86.666), 86.67);
    }

    #[test]
    fn compute_total_weights_by_id() {
        let total = compute_total(
            &[score("c1", 80.0), score("c2", 70.0), score("c3", 90.0)],
            &scheme(),
        );
        assert_eq!(total, 81.0);
    }

    #[test]
    fn compute_total_is_order_independent() {
        let a = compute_total(
            &[score("c1", 80.0), score("c2", 70.0), score("c3", 90.0)],
            &scheme(),
        );
        let b = compute_total(
            &[score("c3", 90.0), score("c1", 80.0), score("c2", 70.0)],
            &scheme(),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn compute_total_missing_component_counts_zero() {
        let total = compute_total(&[score("c3", 90.0)], &scheme());
        assert_eq!(total, 36.0);
    }

    #[test]
    fn compute_total_stays_in_range_for_normalized_scheme() {
        let total = compute_total(
            &[score("c1", 100.0), score("c2", 100.0), score("c3", 100.0)],
            &scheme(),
        );
        assert!((0.0..=100.0).contains(&total));
        assert_eq!(total, 100.0);
    }

    #[test]
    fn compute_total_uses_incomplete_weights_as_stored() {
        // Scheme edited down to a single half-weight component: no
        // renormalization, 80 x 0.5 = 40.
        let lone = vec![SchemeComponent {
            id: "a".to_string(),
            name: "A".to_string(),
            weight: 0.5,
        }];
        assert_eq!(compute_total(&[score("a", 80.0)], &lone), 40.0);
    }

    #[test]
    fn weight_sum_check_tolerates_small_drift() {
        assert_eq!(check_weight_sum(&scheme()), None);
        let mut off = scheme();
        off[2].weight = 0.395;
        assert_eq!(check_weight_sum(&off), None);
        off[2].weight = 0.2;
        let sum = check_weight_sum(&off).expect("should report sum");
        assert!((sum - 0.8).abs() < 1e-9);
    }

    #[test]
    fn clamp_component_score_bounds() {
        assert_eq!(clamp_component_score(-5.0), 0.0);
        assert_eq!(clamp_component_score(105.0), 100.0);
        assert_eq!(clamp_component_score(88.5), 88.5);
        assert_eq!(clamp_component_score(f64::NAN), 0.0);
    }

    #[test]
    fn course_stats_rates_and_formatting() {
        let totals = vec![
            92.0, 95.0, 91.0, 90.0, 93.0, 97.0, 94.0, 96.0, 70.0, 55.0,
        ];
        let stats = course_stats(&totals);
        assert_eq!(stats.count, 10);
        assert!((stats.excellent_rate - 0.8).abs() < 1e-9);
        assert!((stats.pass_rate - 0.9).abs() < 1e-9);
        assert_eq!(format_rate(stats.excellent_rate), "80.0");

        let flags = course_flags(&stats, 0, 10);
        assert_eq!(flags, vec![FLAG_EXCELLENT_RATE_HIGH]);
    }

    #[test]
    fn course_stats_population_std_dev() {
        let stats = course_stats(&[80.0, 60.0]);
        assert_eq!(stats.average, 70.0);
        assert_eq!(stats.std_dev, 10.0);
    }

    #[test]
    fn empty_course_has_no_flags() {
        let stats = course_stats(&[]);
        assert_eq!(stats.average, 0.0);
        assert!(course_flags(&stats, 0, 0).is_empty());
    }

    #[test]
    fn pass_rate_low_flag() {
        let stats = course_stats(&[40.0, 55.0, 70.0]);
        assert!((stats.pass_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(course_flags(&stats, 0, 3), vec![FLAG_PASS_RATE_LOW]);
    }

    #[test]
    fn deviant_threshold_floors_at_three() {
        assert_eq!(deviant_student_threshold(0), 3);
        assert_eq!(deviant_student_threshold(5), 3);
        assert_eq!(deviant_student_threshold(10), 3);
        assert_eq!(deviant_student_threshold(11), 4);
        assert_eq!(deviant_student_threshold(20), 6);
    }

    #[test]
    fn student_deviation_is_absolute() {
        assert!(is_deviant_score(95.0, 70.0));
        assert!(is_deviant_score(50.0, 70.0));
        assert!(!is_deviant_score(85.0, 70.0));
        // Exactly 20 points counts.
        assert!(is_deviant_score(90.0, 70.0));
    }
}
