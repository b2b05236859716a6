//! Scope grammar and permission hierarchy for library catalog tokens.
//!
//! A scope string is a space-separated list of grants. Each grant is either
//! the literal `superuser` or `<prefix>:<role>`, where `prefix` identifies a
//! library and `role` is `admin` or `regular`.
//!
//! # Hierarchy
//!
//! | Held grant | Satisfies |
//! |------------|-----------|
//! | `superuser` | every requirement |
//! | `<p>:admin` | `<p>:admin`, `<p>:regular` |
//! | `<p>:regular` | `<p>:regular` |
//!
//! Grants never cross library prefixes. The pseudo-requirements
//! [`Requirement::None`] and [`Requirement::Any`] do not name a grant at all:
//! `None` is always satisfied and `Any` is satisfied by the presence of a
//! valid token, which is the caller's business to establish.
//!
//! ```
//! use catalog_scope::{Requirement, Role, Scope, ScopeGrant};
//!
//! let scope = Scope::parse("books:admin");
//! assert!(scope.satisfies(&Requirement::Grant(ScopeGrant::library("books", Role::Regular))));
//! assert!(!scope.satisfies(&Requirement::Grant(ScopeGrant::library("other", Role::Regular))));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The literal grant that overrides every requirement.
pub const SUPERUSER: &str = "superuser";

/// Errors produced by strict scope parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// The grant is empty.
    #[error("empty scope grant")]
    Empty,

    /// The grant is neither `superuser` nor `<prefix>:<role>`.
    #[error("malformed scope grant '{0}': expected 'superuser' or '<prefix>:<role>'")]
    Malformed(String),

    /// The role after the colon is not recognised.
    #[error("unknown role '{role}' in scope grant '{grant}'")]
    UnknownRole {
        /// The offending grant.
        grant: String,
        /// The unrecognised role.
        role: String,
    },

    /// The library prefix is empty or contains forbidden characters.
    #[error("invalid library scope prefix '{0}'")]
    InvalidPrefix(String),
}

/// Role held within a single library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control over the library.
    Admin,
    /// Read and ordinary write access.
    Regular,
}

impl Role {
    /// Returns `true` if holding `self` is enough for a route needing `needed`.
    #[must_use]
    pub fn covers(self, needed: Role) -> bool {
        match self {
            Self::Admin => true,
            Self::Regular => needed == Self::Regular,
        }
    }

    /// The weaker of two roles.
    #[must_use]
    pub fn weaker(self, other: Role) -> Role {
        if self.covers(other) { other } else { self }
    }

    /// The role's scope-string spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Regular => "regular",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "regular" => Ok(Self::Regular),
            other => Err(ScopeError::UnknownRole {
                grant: String::new(),
                role: other.to_string(),
            }),
        }
    }
}

/// Check that a library scope prefix is usable inside a grant.
///
/// # Errors
///
/// Returns [`ScopeError::InvalidPrefix`] if the prefix is empty, contains
/// whitespace or contains a colon.
pub fn validate_prefix(prefix: &str) -> Result<(), ScopeError> {
    if prefix.is_empty() || prefix.contains(':') || prefix.chars().any(char::is_whitespace) {
        return Err(ScopeError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// A single entry of a scope string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopeGrant {
    /// Global override.
    Superuser,
    /// A role within one library.
    Library {
        /// Scope prefix of the library.
        prefix: String,
        /// Role held in that library.
        role: Role,
    },
}

impl ScopeGrant {
    /// Build a library grant.
    #[must_use]
    pub fn library(prefix: impl Into<String>, role: Role) -> Self {
        Self::Library {
            prefix: prefix.into(),
            role,
        }
    }

    /// The strongest grant that both `self` and `other` imply, if any.
    #[must_use]
    pub fn meet(&self, other: &ScopeGrant) -> Option<ScopeGrant> {
        match (self, other) {
            (Self::Superuser, grant) | (grant, Self::Superuser) => Some(grant.clone()),
            (
                Self::Library { prefix, role },
                Self::Library {
                    prefix: other_prefix,
                    role: other_role,
                },
            ) => (prefix == other_prefix)
                .then(|| Self::library(prefix.clone(), role.weaker(*other_role))),
        }
    }

    /// Decide whether holding `self` satisfies a route that requires `required`.
    #[must_use]
    pub fn satisfies(&self, required: &ScopeGrant) -> bool {
        match (self, required) {
            (Self::Superuser, _) => true,
            (
                Self::Library { prefix: held, role },
                Self::Library {
                    prefix: wanted,
                    role: needed,
                },
            ) => held == wanted && role.covers(*needed),
            (Self::Library { .. }, Self::Superuser) => false,
        }
    }
}

impl fmt::Display for ScopeGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superuser => f.write_str(SUPERUSER),
            Self::Library { prefix, role } => write!(f, "{prefix}:{role}"),
        }
    }
}

impl FromStr for ScopeGrant {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ScopeError::Empty);
        }
        if s == SUPERUSER {
            return Ok(Self::Superuser);
        }

        let (prefix, role) = s
            .rsplit_once(':')
            .ok_or_else(|| ScopeError::Malformed(s.to_string()))?;
        validate_prefix(prefix)?;
        let role = role.parse::<Role>().map_err(|_| ScopeError::UnknownRole {
            grant: s.to_string(),
            role: role.to_string(),
        })?;

        Ok(Self::library(prefix, role))
    }
}

impl TryFrom<String> for ScopeGrant {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopeGrant> for String {
    fn from(grant: ScopeGrant) -> Self {
        grant.to_string()
    }
}

/// What a route demands of the presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// No token needed.
    None,
    /// Any valid, unexpired token.
    Any,
    /// A specific grant, honouring the hierarchy.
    Grant(ScopeGrant),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Any => f.write_str("any"),
            Self::Grant(grant) => grant.fmt(f),
        }
    }
}

/// An ordered, de-duplicated set of grants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    grants: Vec<ScopeGrant>,
}

impl Scope {
    /// Parse a scope string leniently.
    ///
    /// Entries that do not parse are dropped: an unreadable grant must never
    /// widen access, so ignoring it is the safe reading.
    #[must_use]
    pub fn parse(scope: &str) -> Self {
        scope
            .split_whitespace()
            .filter_map(|entry| entry.parse::<ScopeGrant>().ok())
            .collect()
    }

    /// Parse a scope string, rejecting any malformed entry.
    ///
    /// # Errors
    ///
    /// Returns the first [`ScopeError`] encountered.
    pub fn parse_strict(scope: &str) -> Result<Self, ScopeError> {
        scope
            .split_whitespace()
            .map(str::parse::<ScopeGrant>)
            .collect::<Result<Vec<_>, _>>()
            .map(|grants| grants.into_iter().collect())
    }

    /// The grants, in first-seen order.
    #[must_use]
    pub fn grants(&self) -> &[ScopeGrant] {
        &self.grants
    }

    /// Returns `true` if the scope holds no grants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Returns `true` if the scope holds the `superuser` grant.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        self.grants.contains(&ScopeGrant::Superuser)
    }

    /// Decide whether this scope satisfies `requirement`.
    #[must_use]
    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        match requirement {
            Requirement::None | Requirement::Any => true,
            Requirement::Grant(required) => self.grants.iter().any(|g| g.satisfies(required)),
        }
    }

    /// Intersect this scope with `ceiling`.
    ///
    /// Each held grant is paired with every ceiling grant and reduced to what
    /// both allow: `superuser` yields the other side, two grants on the same
    /// prefix yield the weaker role, and different prefixes yield nothing.
    /// Used when re-deriving a token's scope from an older grant, so the
    /// result is never wider than either input.
    #[must_use]
    pub fn narrow_to(&self, ceiling: &Scope) -> Scope {
        self.grants
            .iter()
            .flat_map(|held| ceiling.grants.iter().filter_map(move |cap| held.meet(cap)))
            .collect()
    }
}

impl FromIterator<ScopeGrant> for Scope {
    fn from_iter<I: IntoIterator<Item = ScopeGrant>>(iter: I) -> Self {
        let mut grants: Vec<ScopeGrant> = Vec::new();
        for grant in iter {
            if !grants.contains(&grant) {
                grants.push(grant);
            }
        }
        Self { grants }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for grant in &self.grants {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            grant.fmt(f)?;
        }
        Ok(())
    }
}

/// Decide whether a raw token scope string satisfies `requirement`.
#[must_use]
pub fn satisfies(token_scope: &str, requirement: &Requirement) -> bool {
    Scope::parse(token_scope).satisfies(requirement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn grant(s: &str) -> Requirement {
        Requirement::Grant(s.parse().unwrap())
    }

    #[test]
    fn parses_superuser_and_library_grants() {
        assert_eq!("superuser".parse::<ScopeGrant>().unwrap(), ScopeGrant::Superuser);
        assert_eq!(
            "lib1:admin".parse::<ScopeGrant>().unwrap(),
            ScopeGrant::library("lib1", Role::Admin)
        );
        assert_eq!(
            "lib1:regular".parse::<ScopeGrant>().unwrap(),
            ScopeGrant::library("lib1", Role::Regular)
        );
    }

    #[test]
    fn rejects_malformed_grants() {
        assert_eq!("".parse::<ScopeGrant>(), Err(ScopeError::Empty));
        assert!(matches!("lib1".parse::<ScopeGrant>(), Err(ScopeError::Malformed(_))));
        assert!(matches!(
            "lib1:owner".parse::<ScopeGrant>(),
            Err(ScopeError::UnknownRole { .. })
        ));
        assert!(matches!(":admin".parse::<ScopeGrant>(), Err(ScopeError::InvalidPrefix(_))));
        assert!(matches!("a:b:admin".parse::<ScopeGrant>(), Err(ScopeError::InvalidPrefix(_))));
        assert!(matches!("Superuser".parse::<ScopeGrant>(), Err(ScopeError::Malformed(_))));
    }

    #[test]
    fn admin_satisfies_own_library_only() {
        let scope = Scope::parse("lib1:admin");

        assert!(scope.satisfies(&grant("lib1:admin")));
        assert!(scope.satisfies(&grant("lib1:regular")));
        assert!(!scope.satisfies(&grant("lib2:regular")));
        assert!(!scope.satisfies(&grant("lib2:admin")));
        assert!(!scope.satisfies(&grant("superuser")));
    }

    #[test]
    fn regular_does_not_reach_admin() {
        let scope = Scope::parse("lib1:regular");

        assert!(scope.satisfies(&grant("lib1:regular")));
        assert!(!scope.satisfies(&grant("lib1:admin")));
    }

    #[test]
    fn superuser_satisfies_everything() {
        let scope = Scope::parse("superuser");

        for required in ["lib1:admin", "lib1:regular", "lib2:regular", "lib2:admin", "superuser"] {
            assert!(scope.satisfies(&grant(required)), "superuser should satisfy {required}");
        }
    }

    #[test]
    fn pseudo_requirements() {
        let empty = Scope::parse("");

        assert!(empty.satisfies(&Requirement::None));
        assert!(empty.satisfies(&Requirement::Any));
        assert!(!empty.satisfies(&grant("lib1:regular")));
    }

    #[test]
    fn mixed_scope_checks_each_grant() {
        let scope = Scope::parse("lib1:regular  lib2:admin");

        assert!(scope.satisfies(&grant("lib1:regular")));
        assert!(!scope.satisfies(&grant("lib1:admin")));
        assert!(scope.satisfies(&grant("lib2:regular")));
        assert!(scope.satisfies(&grant("lib2:admin")));
        assert!(!scope.satisfies(&grant("lib3:regular")));
    }

    #[test]
    fn lenient_parse_drops_garbage() {
        // GIVEN: a scope string with junk next to a real grant
        let scope = Scope::parse("lib1:regular bogus lib1:owner superuser:admin");

        // THEN: only well-formed grants survive
        assert_eq!(
            scope.grants(),
            &[
                ScopeGrant::library("lib1", Role::Regular),
                ScopeGrant::library("superuser", Role::Admin),
            ]
        );
        assert!(!scope.is_superuser());
    }

    #[test]
    fn strict_parse_reports_first_error() {
        assert!(Scope::parse_strict("lib1:regular lib2:admin").is_ok());
        assert!(matches!(
            Scope::parse_strict("lib1:regular bogus"),
            Err(ScopeError::Malformed(s)) if s == "bogus"
        ));
    }

    #[test]
    fn display_round_trips_and_dedupes() {
        let scope = Scope::parse("lib1:admin  superuser lib1:admin");

        assert_eq!(scope.to_string(), "lib1:admin superuser");
        assert_eq!(Scope::parse(&scope.to_string()), scope);
    }

    #[test]
    fn narrow_to_drops_grants_no_longer_held() {
        // GIVEN: a token scope issued when the user was admin of two libraries
        let token = Scope::parse("lib1:admin lib2:admin lib3:regular");
        // AND: the user has since lost lib2 and been demoted to regular in lib1
        let current = Scope::parse("lib1:regular lib3:admin");

        // WHEN: narrowing the token scope to the user's current scope
        let narrowed = token.narrow_to(&current);

        // THEN: lib2 is gone, lib1 drops to regular, lib3 stays regular
        assert_eq!(narrowed.to_string(), "lib1:regular lib3:regular");
    }

    #[test]
    fn narrow_to_demotes_admin_to_regular() {
        let narrowed = Scope::parse("comics:admin").narrow_to(&Scope::parse("comics:regular"));

        assert_eq!(narrowed.to_string(), "comics:regular");
    }

    #[test]
    fn narrow_to_superuser_token_takes_the_ceiling() {
        // GIVEN: a superuser token, and the user has since become a library admin
        let token = Scope::parse("superuser");
        let current = Scope::parse("books:admin other:regular");

        // WHEN / THEN: the narrowed scope is exactly what the user holds now
        assert_eq!(token.narrow_to(&current), current);
    }

    #[test]
    fn narrow_to_never_widens() {
        let cases = [
            ("books:regular", "books:admin"),
            ("books:admin", "other:admin"),
            ("superuser books:regular", "books:admin"),
            ("", "superuser"),
        ];
        for (token, ceiling) in cases {
            let (token, ceiling) = (Scope::parse(token), Scope::parse(ceiling));
            let narrowed = token.narrow_to(&ceiling);
            for grant in narrowed.grants() {
                let required = Requirement::Grant(grant.clone());
                assert!(token.satisfies(&required), "{token} -> {grant}");
                assert!(ceiling.satisfies(&required), "{ceiling} -> {grant}");
            }
        }
        assert_eq!(
            Scope::parse("books:regular").narrow_to(&Scope::parse("books:admin")).to_string(),
            "books:regular"
        );
    }

    #[test]
    fn weaker_role() {
        assert_eq!(Role::Admin.weaker(Role::Regular), Role::Regular);
        assert_eq!(Role::Regular.weaker(Role::Admin), Role::Regular);
        assert_eq!(Role::Admin.weaker(Role::Admin), Role::Admin);
    }

    #[test]
    fn narrow_to_superuser_ceiling_keeps_everything() {
        let token = Scope::parse("lib1:admin lib2:regular");
        let narrowed = token.narrow_to(&Scope::parse("superuser"));

        assert_eq!(narrowed, token);
    }

    #[test]
    fn grant_serde_uses_scope_spelling() {
        let grant = ScopeGrant::library("books", Role::Admin);
        let json = serde_json::to_string(&grant).unwrap();
        assert_eq!(json, "\"books:admin\"");

        let back: ScopeGrant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, grant);
        assert!(serde_json::from_str::<ScopeGrant>("\"books\"").is_err());
    }

    #[test]
    fn free_function_matches_method() {
        assert!(satisfies("lib1:admin", &grant("lib1:regular")));
        assert!(!satisfies("lib1:admin", &grant("lib2:regular")));
    }
}
