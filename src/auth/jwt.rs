use anyhow::Result;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authz::{CurrentOrganization, Role};
use crate::config::AppConfig;
use crate::org_context::MembershipSummary;

#[derive(Clone)]
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    expiry: Duration,
}

/// Everything projected into a session token at issue time.
#[derive(Debug, Clone)]
pub struct SessionProjection {
    pub user_id: Uuid,
    pub email: String,
    pub memberships: Vec<MembershipSummary>,
    pub current: Option<CurrentOrganization>,
}

impl JwtService {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            &config.jwt_secret,
            &config.jwt_issuer,
            &config.jwt_audience,
            config.jwt_expiry_minutes,
        ))
    }

    pub fn new(secret: &str, issuer: &str, audience: &str, expiry_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            expiry: Duration::minutes(expiry_minutes),
        }
    }

    pub fn expires_in_seconds(&self) -> i64 {
        self.expiry.num_seconds()
    }

    pub fn generate_token(&self, projection: &SessionProjection) -> Result<String> {
        let now = Utc::now();
        let exp = now + self.expiry;
        let claims = Claims {
            sub: projection.user_id,
            email: projection.email.clone(),
            memberships: projection
                .memberships
                .iter()
                .map(|membership| MembershipClaim {
                    organization_id: membership.organization_id,
                    organization_name: membership.organization_name.clone(),
                    role: membership.role,
                })
                .collect(),
            current_organization_id: projection.current.map(|c| c.organization_id),
            current_role: projection.current.map(|c| c.role),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp() as usize,
            exp: exp.timestamp() as usize,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(&[self.audience.clone()]);
        validation.set_issuer(&[self.issuer.clone()]);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipClaim {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    #[serde(default)]
    pub memberships: Vec<MembershipClaim>,
    pub current_organization_id: Option<Uuid>,
    pub current_role: Option<Role>,
    pub iss: String,
    pub aud: String,
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    /// The current organization, only when both halves were projected.
    pub fn current(&self) -> Option<CurrentOrganization> {
        match (self.current_organization_id, self.current_role) {
            (Some(organization_id), Some(role)) => Some(CurrentOrganization {
                organization_id,
                role,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{JwtService, SessionProjection};
    use crate::authz::{CurrentOrganization, Role};
    use crate::org_context::MembershipSummary;

    fn service() -> JwtService {
        JwtService::new("test-secret", "test-issuer", "test-audience", 60)
    }

    #[test]
    fn projects_memberships_and_current_organization() {
        let org = Uuid::new_v4();
        let other = Uuid::new_v4();
        let projection = SessionProjection {
            user_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            memberships: vec![
                MembershipSummary {
                    organization_id: org,
                    organization_name: "Acme Cooling".to_string(),
                    organization_type: "vendor".to_string(),
                    role: Role::Administrator,
                },
                MembershipSummary {
                    organization_id: other,
                    organization_name: "Northside Clinic".to_string(),
                    organization_type: "customer".to_string(),
                    role: Role::Customer,
                },
            ],
            current: Some(CurrentOrganization {
                organization_id: org,
                role: Role::Administrator,
            }),
        };

        let jwt = service();
        let token = jwt.generate_token(&projection).unwrap();
        let claims = jwt.verify_token(&token).unwrap();

        assert_eq!(claims.sub, projection.user_id);
        assert_eq!(claims.memberships.len(), 2);
        assert_eq!(claims.memberships[1].role, Role::Customer);
        assert_eq!(claims.current(), projection.current);
    }

    #[test]
    fn missing_current_organization_projects_none() {
        let projection = SessionProjection {
            user_id: Uuid::new_v4(),
            email: "solo@example.com".to_string(),
            memberships: Vec::new(),
            current: None,
        };
        let jwt = service();
        let claims = jwt.verify_token(&jwt.generate_token(&projection).unwrap()).unwrap();
        assert_eq!(claims.current(), None);
        assert!(claims.memberships.is_empty());
    }

    #[test]
    fn rejects_tokens_for_another_audience() {
        let projection = SessionProjection {
            user_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            memberships: Vec::new(),
            current: None,
        };
        let token = JwtService::new("test-secret", "test-issuer", "other", 60)
            .generate_token(&projection)
            .unwrap();
        assert!(service().verify_token(&token).is_err());
    }
}
