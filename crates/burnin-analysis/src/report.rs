use std::borrow::Cow;

use crate::EvaluationReport;

pub const REPORT_HEADER: &str = "item,value,min,max,result";

pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "N/A".to_string(),
    }
}

/// Quotes a field when it holds a separator, quote or line break; embedded
/// quotes are doubled.
pub fn csv_field(raw: &str) -> Cow<'_, str> {
    if raw.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(raw)
    }
}

/// Tabular summary, one row per item followed by one row per structural error.
pub fn render_report_csv(report: &EvaluationReport) -> String {
    let mut out = String::from(REPORT_HEADER);
    out.push('\n');
    for item in &report.items {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_field(&item.item),
            format_value(item.observed),
            item.low,
            item.high,
            item.result
        ));
    }
    for err in &report.structural_errors {
        out.push_str(&format!("{},N/A,,,FAIL\n", csv_field(&err.to_string())));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StructuralError;

    #[test]
    fn renders_items_and_structural_rows() {
        let mut report = EvaluationReport::default();
        report.push_item("cpu_temp", Some(81.234), 60.0, 95.0);
        report.push_item("fan_rpm", None, 3000.0, 6000.0);
        report
            .structural_errors
            .push(StructuralError::MissingColumn("fan_rpm".into()));
        let csv = render_report_csv(&report);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], REPORT_HEADER);
        assert_eq!(lines[1], "cpu_temp,81.23,60,95,PASS");
        assert_eq!(lines[2], "fan_rpm,N/A,3000,6000,FAIL");
        assert_eq!(lines[3], "configured column missing: fan_rpm,N/A,,,FAIL");
    }

    #[test]
    fn awkward_names_stay_in_their_column() {
        let mut report = EvaluationReport::default();
        report.push_item("temp,core0", Some(70.0), 60.0, 95.0);
        report.push_item("fan \"left\"", Some(4000.0), 3000.0, 6000.0);
        report
            .structural_errors
            .push(StructuralError::MissingColumn("a,b".into()));
        let csv = render_report_csv(&report);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[1], "\"temp,core0\",70.00,60,95,PASS");
        assert_eq!(lines[2], "\"fan \"\"left\"\"\",4000.00,3000,6000,PASS");
        assert_eq!(lines[3], "\"configured column missing: a,b\",N/A,,,FAIL");
        assert_eq!(csv_field("cpu_temp"), "cpu_temp");
    }
}
