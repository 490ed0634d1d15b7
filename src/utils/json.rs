use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use validator::Validate;

use crate::error::AppError;

/// JSON body that has been deserialized and validated.
///
/// Malformed bodies and schema violations are both reported as 400, the
/// latter with field-level details.
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| AppError::bad_request(rejection.body_text()))?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Distinguishes an omitted field (`None`) from an explicit `null`
/// (`Some(None)`). Use with `#[serde(default, deserialize_with = "nullable")]`.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::nullable;

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "nullable")]
        plan: Option<Option<String>>,
    }

    #[test]
    fn omitted_null_and_value_are_distinct() {
        let omitted: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(omitted.plan, None);

        let cleared: Patch = serde_json::from_str(r#"{"plan": null}"#).unwrap();
        assert_eq!(cleared.plan, Some(None));

        let set: Patch = serde_json::from_str(r#"{"plan": "pro"}"#).unwrap();
        assert_eq!(set.plan, Some(Some("pro".to_string())));
    }
}
