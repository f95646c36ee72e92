use serde::{Deserialize, Deserializer};
use serde_json::Value;

const UNION_LOGIN_ID: &str = "UNION_LOGIN_ID";

pub fn get_login_id() -> String {
    std::env::var(UNION_LOGIN_ID).unwrap_or_default()
}

const UNION_LOGIN_PWD: &str = "UNION_LOGIN_PWD";

pub fn get_login_password() -> String {
    std::env::var(UNION_LOGIN_PWD).unwrap_or_default()
}

const CAPSOLVER_API_KEY: &str = "CAPSOLVER_API_KEY";

pub fn get_captcha_key() -> Option<String> {
    non_empty_var(CAPSOLVER_API_KEY)
}

const GMAIL_CLIENT_ID: &str = "GMAIL_CLIENT_ID";
const GMAIL_CLIENT_SECRET: &str = "GMAIL_CLIENT_SECRET";
const GMAIL_REFRESH_TOKEN: &str = "GMAIL_REFRESH_TOKEN";

pub fn get_gmail_client_id() -> Option<String> {
    non_empty_var(GMAIL_CLIENT_ID)
}

pub fn get_gmail_client_secret() -> Option<String> {
    non_empty_var(GMAIL_CLIENT_SECRET)
}

pub fn get_gmail_refresh_token() -> Option<String> {
    non_empty_var(GMAIL_REFRESH_TOKEN)
}

const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";

pub fn get_telegram_token() -> Option<String> {
    non_empty_var(TELEGRAM_BOT_TOKEN)
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses the portal's amount strings ("90,900", " -1,250.50 ").
///
/// Blank, missing and unparseable input all yield 0.
pub fn parse_amount(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };

    let cleaned = raw.replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return 0.0;
    }

    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Serde adapter for amount fields that may arrive as strings, numbers or null.
pub fn lenient_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => parse_amount(Some(&s)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Serde adapter for text fields that the portal sometimes sends as numbers.
pub fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

/// Formats an amount with thousands separators and two decimals: `-1,050.00`.
pub fn format_amount(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (whole, fraction) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if value < 0.0 && formatted != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{fraction}")
}

/// Keeps the first and last four characters of a secret for log output.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
