use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Privilege tier a member holds within one organization.
///
/// The roles form a single global ladder from `Root` down to `User`. The rank
/// behind the ladder is private to this module: everything outside compares
/// roles through [`Role::satisfies`] or [`Role::outranks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Root,
    Administrator,
    Manager,
    Supervisor,
    Technician,
    Dispatcher,
    Estimator,
    Customer,
    User,
}

impl Role {
    /// Every role, highest first.
    pub const ALL: [Role; 9] = [
        Role::Root,
        Role::Administrator,
        Role::Manager,
        Role::Supervisor,
        Role::Technician,
        Role::Dispatcher,
        Role::Estimator,
        Role::Customer,
        Role::User,
    ];

    const fn rank(self) -> u8 {
        match self {
            Role::Root => 9,
            Role::Administrator => 8,
            Role::Manager => 7,
            Role::Supervisor => 6,
            Role::Technician => 5,
            Role::Dispatcher => 4,
            Role::Estimator => 3,
            Role::Customer => 2,
            Role::User => 1,
        }
    }

    /// True when `self` is at least as privileged as `minimum`.
    pub const fn satisfies(self, minimum: Role) -> bool {
        self.rank() >= minimum.rank()
    }

    /// True when `self` is strictly more privileged than `other`.
    pub const fn outranks(self, other: Role) -> bool {
        self.rank() > other.rank()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Root => "ROOT",
            Role::Administrator => "ADMINISTRATOR",
            Role::Manager => "MANAGER",
            Role::Supervisor => "SUPERVISOR",
            Role::Technician => "TECHNICIAN",
            Role::Dispatcher => "DISPATCHER",
            Role::Estimator => "ESTIMATOR",
            Role::Customer => "CUSTOMER",
            Role::User => "USER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| UnknownRole(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn ladder_is_a_total_order() {
        for (i, higher) in Role::ALL.iter().enumerate() {
            for (j, lower) in Role::ALL.iter().enumerate() {
                assert_eq!(
                    higher.satisfies(*lower),
                    i <= j,
                    "{higher} satisfies {lower}"
                );
                assert_eq!(higher.outranks(*lower), i < j, "{higher} outranks {lower}");
            }
        }
    }

    #[test]
    fn every_role_satisfies_itself() {
        for role in Role::ALL {
            assert!(role.satisfies(role));
            assert!(!role.outranks(role));
        }
    }

    #[test]
    fn manager_does_not_satisfy_administrator() {
        assert!(!Role::Manager.satisfies(Role::Administrator));
        assert!(Role::Administrator.satisfies(Role::Manager));
        assert!(Role::Root.satisfies(Role::Administrator));
    }

    #[test]
    fn dispatcher_sits_below_technician() {
        assert!(Role::Technician.outranks(Role::Dispatcher));
        assert!(Role::Dispatcher.outranks(Role::Estimator));
        assert!(Role::Customer.outranks(Role::User));
    }

    #[test]
    fn parses_wire_names() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("administrator".parse::<Role>().is_err());
        assert!("OWNER".parse::<Role>().is_err());
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&Role::Administrator).unwrap();
        assert_eq!(json, "\"ADMINISTRATOR\"");
        let parsed: Role = serde_json::from_str("\"TECHNICIAN\"").unwrap();
        assert_eq!(parsed, Role::Technician);
    }
}
