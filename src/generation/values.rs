//! Field-name heuristics for synthesizing form input.

use serde_json::{json, Map, Value};

use crate::models::{ElementInfo, ElementKind};

/// Selectors of inline error indicators, joined into one selector list.
pub const ERROR_INDICATORS: &[&str] = &[
    ".error",
    ".invalid-feedback",
    ".field-error",
    ".alert-danger",
    "[role=alert]",
    "[aria-invalid=true]",
];

/// Page text that signals a create/update succeeded.
pub const SUCCESS_KEYWORDS: &[&str] = &["created", "saved", "success", "added", "updated"];

/// What kind of data a form field expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    Email,
    Password,
    Phone,
    Url,
    Date,
    Price,
    Number,
    Zip,
    Username,
    Name,
    Description,
    Search,
    Text,
    Choice,
    Toggle,
}

/// Value to put into a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Choice(String),
    Check,
    Skip,
}

/// Classify a field by its type, then by its name/id/placeholder.
pub fn categorize(el: &ElementInfo) -> FieldCategory {
    if el.kind == ElementKind::Select {
        return FieldCategory::Choice;
    }
    match el.input_type.as_deref() {
        Some("password") => return FieldCategory::Password,
        Some("email") => return FieldCategory::Email,
        Some("tel") => return FieldCategory::Phone,
        Some("url") => return FieldCategory::Url,
        Some("date" | "datetime-local") => return FieldCategory::Date,
        Some("number" | "range") => return FieldCategory::Number,
        Some("search") => return FieldCategory::Search,
        Some("checkbox" | "radio") => return FieldCategory::Toggle,
        _ => {}
    }

    let d = el.descriptor();
    if el.kind == ElementKind::Textarea
        || ["description", "message", "comment", "notes", "bio", "body"]
            .iter()
            .any(|k| d.contains(k))
    {
        return FieldCategory::Description;
    }
    let rules: &[(&[&str], FieldCategory)] = &[
        (&["email", "e-mail"], FieldCategory::Email),
        (&["password", "passwd"], FieldCategory::Password),
        (&["phone", "mobile", "tel"], FieldCategory::Phone),
        (&["website", "url", "link"], FieldCategory::Url),
        (&["date", "birthday", "dob"], FieldCategory::Date),
        (&["price", "amount", "cost", "total"], FieldCategory::Price),
        (&["quantity", "qty", "number", "count", "age"], FieldCategory::Number),
        (&["zip", "postal"], FieldCategory::Zip),
        (&["username", "user", "login", "account"], FieldCategory::Username),
        (&["name", "title"], FieldCategory::Name),
        (&["search", "query"], FieldCategory::Search),
    ];
    rules
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| d.contains(k)))
        .map(|(_, category)| *category)
        .unwrap_or(FieldCategory::Text)
}

/// A valid sample value for a field.
pub fn sample_value(el: &ElementInfo) -> FieldValue {
    let text = |s: &str| FieldValue::Text(s.to_string());
    match categorize(el) {
        FieldCategory::Email => text("autotest@example.com"),
        FieldCategory::Password => text("AutoTest#2024pass"),
        FieldCategory::Phone => text("555-0100"),
        FieldCategory::Url => text("https://example.com"),
        FieldCategory::Date => text("2024-01-15"),
        FieldCategory::Price => text("19.99"),
        FieldCategory::Number => text("42"),
        FieldCategory::Zip => text("90210"),
        FieldCategory::Username => text("autotest_user"),
        FieldCategory::Name => text("Autotest Sample"),
        FieldCategory::Description => text("Created by autotest for verification."),
        FieldCategory::Search => text("test"),
        FieldCategory::Text => text("test value"),
        FieldCategory::Choice => el
            .options
            .iter()
            .find(|o| !o.trim().is_empty())
            .map(|o| FieldValue::Choice(o.clone()))
            .unwrap_or(FieldValue::Skip),
        FieldCategory::Toggle => FieldValue::Check,
    }
}

/// A fresh account identity for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedIdentity {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl GeneratedIdentity {
    pub fn fresh() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let short = &tag[..8];
        Self {
            username: format!("autotest_{}", short),
            email: format!("autotest_{}@example.com", short),
            password: format!("At#{}x9Z", short),
        }
    }

    /// Value for a registration field: identity fields get the identity,
    /// everything else a sample value.
    pub fn value_for(&self, el: &ElementInfo) -> FieldValue {
        match categorize(el) {
            FieldCategory::Email => FieldValue::Text(self.email.clone()),
            FieldCategory::Password => FieldValue::Text(self.password.clone()),
            FieldCategory::Username => FieldValue::Text(self.username.clone()),
            _ => sample_value(el),
        }
    }
}

/// JSON body synthesized from an endpoint's schema, or a generic record.
pub fn body_from_schema(schema: Option<&Value>) -> Value {
    let Some(properties) = schema
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object)
    else {
        return json!({ "name": "Autotest Sample", "description": "Created by autotest" });
    };

    let mut body = Map::new();
    for (name, prop) in properties {
        let lower = name.to_lowercase();
        let value = match prop.get("type").and_then(Value::as_str) {
            Some("integer") => json!(1),
            Some("number") => json!(19.99),
            Some("boolean") => json!(true),
            Some("array") => json!([]),
            Some("object") => json!({}),
            _ if lower.contains("email") => json!("autotest@example.com"),
            _ if lower.contains("password") => json!("AutoTest#2024pass"),
            _ if lower.contains("date") => json!("2024-01-15"),
            _ if lower.contains("url") => json!("https://example.com"),
            _ => json!(format!("autotest {}", name)),
        };
        body.insert(name.clone(), value);
    }
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, input_type: &str) -> ElementInfo {
        let mut el = ElementInfo::new(ElementKind::Input, format!("[name=\"{}\"]", name));
        el.name = Some(name.into());
        el.input_type = Some(input_type.into());
        el
    }

    #[test]
    fn test_type_wins_over_name() {
        assert_eq!(categorize(&field("contact", "email")), FieldCategory::Email);
        assert_eq!(categorize(&field("user_pw", "password")), FieldCategory::Password);
    }

    #[test]
    fn test_name_heuristics() {
        assert_eq!(categorize(&field("unit_price", "text")), FieldCategory::Price);
        assert_eq!(categorize(&field("phone_number", "text")), FieldCategory::Phone);
        assert_eq!(categorize(&field("product_title", "text")), FieldCategory::Name);
        assert_eq!(categorize(&field("description", "text")), FieldCategory::Description);
        assert_eq!(categorize(&field("foo", "text")), FieldCategory::Text);
    }

    #[test]
    fn test_select_takes_first_non_empty_option() {
        let mut el = ElementInfo::new(ElementKind::Select, "#country");
        el.options = vec!["".into(), "nl".into(), "de".into()];
        assert_eq!(sample_value(&el), FieldValue::Choice("nl".into()));
        el.options.clear();
        assert_eq!(sample_value(&el), FieldValue::Skip);
    }

    #[test]
    fn test_identities_are_unique() {
        let a = GeneratedIdentity::fresh();
        let b = GeneratedIdentity::fresh();
        assert_ne!(a.email, b.email);
        assert_eq!(a.value_for(&field("email", "email")), FieldValue::Text(a.email.clone()));
        assert_eq!(a.value_for(&field("pw", "password")), FieldValue::Text(a.password.clone()));
    }

    #[test]
    fn test_body_from_schema() {
        let schema = json!({"properties": {"qty": {"type": "integer"}, "email": {"type": "string"}}});
        let body = body_from_schema(Some(&schema));
        assert_eq!(body["qty"], 1);
        assert_eq!(body["email"], "autotest@example.com");
        assert!(body_from_schema(None).get("name").is_some());
    }
}
