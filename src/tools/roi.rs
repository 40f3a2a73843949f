use super::{parse_input, ToolHandler};
use crate::completion::ToolSpec;
use crate::models::{ToolContext, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_AVERAGE_SALARY: f64 = 60_000.0;
pub const DEFAULT_EFFICIENCY_GAIN: f64 = 0.20;
pub const ASSESSMENT_PRICE: f64 = 25_000.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiInput {
    pub employee_count: f64,
    pub average_salary: Option<f64>,
    pub efficiency_gain: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub gain: String,
    pub opportunity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenarios {
    pub conservative: Scenario,
    pub expected: Scenario,
    pub optimistic: Scenario,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiEstimate {
    pub employee_count: f64,
    pub average_salary: f64,
    pub efficiency_gain: String,
    pub annual_capacity_opportunity: f64,
    pub formatted_capacity: String,
    pub assessment_investment: f64,
    pub roi_multiple: String,
    pub scenarios: Scenarios,
    pub context: String,
}

/// Annual capacity freed by an efficiency gain, with three reference scenarios.
pub fn estimate(input: &RoiInput) -> RoiEstimate {
    let salary = input.average_salary.unwrap_or(DEFAULT_AVERAGE_SALARY);
    let gain = input.efficiency_gain.unwrap_or(DEFAULT_EFFICIENCY_GAIN);
    let payroll = input.employee_count * salary;
    let capacity = payroll * gain;
    let formatted_capacity = format_capacity(capacity);
    let multiple = (capacity / ASSESSMENT_PRICE).round();
    let gain_text = percent(gain);

    let context = format!(
        "At {} employees with a {} efficiency gain, that's {} in annual capacity opportunity. The assessment investment of $25K represents a {}x return.",
        group_thousands(input.employee_count),
        gain_text,
        formatted_capacity,
        multiple
    );

    RoiEstimate {
        employee_count: input.employee_count,
        average_salary: salary,
        efficiency_gain: gain_text.clone(),
        annual_capacity_opportunity: capacity,
        formatted_capacity: formatted_capacity.clone(),
        assessment_investment: ASSESSMENT_PRICE,
        roi_multiple: format!("{}x", multiple),
        scenarios: Scenarios {
            conservative: Scenario {
                gain: "15%".to_string(),
                opportunity: millions(payroll * 0.15),
            },
            expected: Scenario {
                gain: gain_text,
                opportunity: formatted_capacity,
            },
            optimistic: Scenario {
                gain: "25%".to_string(),
                opportunity: millions(payroll * 0.25),
            },
        },
        context,
    }
}

fn percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}

fn millions(amount: f64) -> String {
    format!("${:.1} million", amount / 1_000_000.0)
}

/// `$12.0 million` at or above a million, `$750K` below.
pub fn format_capacity(amount: f64) -> String {
    if amount / 1_000_000.0 >= 1.0 {
        millions(amount)
    } else {
        format!("${:.0}K", amount / 1_000.0)
    }
}

/// `12500` → `12,500`; fractional counts keep up to three decimals.
pub fn group_thousands(value: f64) -> String {
    let millis = (value.abs() * 1_000.0).round() as u64;
    let whole = millis / 1_000;
    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 && millis > 0 { "-" } else { "" };
    match millis % 1_000 {
        0 => format!("{}{}", sign, grouped),
        fraction => {
            let tail = format!(".{:03}", fraction);
            format!("{}{}{}", sign, grouped, tail.trim_end_matches('0'))
        }
    }
}

#[derive(Debug, Default)]
pub struct CalculateRoiTool;

#[async_trait]
impl ToolHandler for CalculateRoiTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculate_roi".to_string(),
            description: "Calculate and present the AI workforce optimization opportunity. Use this when discussing ROI or the business case for the AI Assessment.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "employeeCount": { "type": "number", "description": "Number of employees (required)" },
                    "averageSalary": { "type": "number", "description": "Average salary (default: $60,000)" },
                    "efficiencyGain": { "type": "number", "description": "Expected efficiency gain as decimal (default: 0.20 for 20%)" }
                },
                "required": ["employeeCount"]
            }),
        }
    }

    async fn call(&self, input: Value, _context: &ToolContext) -> ToolResult {
        let input: RoiInput = match parse_input("calculate_roi", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        if !(input.employee_count > 0.0) {
            return ToolResult::failure("employeeCount must be a positive number");
        }
        let estimate = estimate(&input);
        match serde_json::to_value(&estimate) {
            Ok(data) => ToolResult::ok(data, estimate.context, true),
            Err(err) => ToolResult::failure(format!("Failed to calculate ROI: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(employee_count: f64) -> RoiInput {
        RoiInput {
            employee_count,
            average_salary: None,
            efficiency_gain: None,
        }
    }

    #[test]
    fn thousand_employees_with_defaults() {
        let estimate = estimate(&input(1000.0));
        assert_eq!(estimate.annual_capacity_opportunity, 12_000_000.0);
        assert_eq!(estimate.formatted_capacity, "$12.0 million");
        assert_eq!(estimate.roi_multiple, "480x");
        assert_eq!(estimate.efficiency_gain, "20%");
        assert_eq!(estimate.scenarios.conservative.opportunity, "$9.0 million");
        assert_eq!(estimate.scenarios.optimistic.opportunity, "$15.0 million");
        assert_eq!(
            estimate.context,
            "At 1,000 employees with a 20% efficiency gain, that's $12.0 million in annual capacity opportunity. The assessment investment of $25K represents a 480x return."
        );
    }

    #[test]
    fn small_capacity_is_shown_in_thousands() {
        let estimate = estimate(&RoiInput {
            employee_count: 50.0,
            average_salary: Some(50_000.0),
            efficiency_gain: Some(0.3),
        });
        assert_eq!(estimate.formatted_capacity, "$750K");
        assert_eq!(estimate.roi_multiple, "30x");
        assert_eq!(estimate.scenarios.expected.gain, "30%");
    }

    #[test]
    fn groups_thousands() {
        assert_eq!(group_thousands(999.0), "999");
        assert_eq!(group_thousands(12_500.0), "12,500");
        assert_eq!(group_thousands(1_234_567.0), "1,234,567");
        assert_eq!(group_thousands(1_000.5), "1,000.5");
        assert_eq!(group_thousands(1_000.0001), "1,000");
        assert_eq!(group_thousands(999.9996), "1,000");
        assert_eq!(group_thousands(2.25), "2.25");
    }

    #[tokio::test]
    async fn non_positive_count_fails() {
        let result = CalculateRoiTool
            .call(json!({"employeeCount": 0}), &ToolContext::default())
            .await;
        assert!(!result.success);

        let ok = CalculateRoiTool
            .call(json!({"employeeCount": 1000}), &ToolContext::default())
            .await;
        assert_eq!(ok.data.expect("data")["roiMultiple"], "480x");
        assert!(ok.display_to_user);
    }
}
