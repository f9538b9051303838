//! Eligibility filter: may this recipient be notified?

use courier_common::types::{RecipientRecord, Role, SkipReason};

/// Return the usable push token, or the reason the recipient must be skipped.
///
/// The role is checked before the token so a non-driver without a token is
/// reported as `IneligibleRole`.
pub fn check<'a>(record: &'a RecipientRecord, expected_role: &Role) -> Result<&'a str, SkipReason> {
    if &record.role != expected_role {
        return Err(SkipReason::IneligibleRole);
    }

    match record.push_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(SkipReason::NoToken),
    }
}

/// True iff the role matches and a non-empty push token is present.
pub fn is_eligible(record: &RecipientRecord, expected_role: &Role) -> bool {
    check(record, expected_role).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::RecipientStatus;

    fn make_record(role: Role, token: Option<&str>) -> RecipientRecord {
        RecipientRecord {
            recipient_id: "r1".to_string(),
            role,
            push_token: token.map(str::to_string),
            status: RecipientStatus::Active,
        }
    }

    #[test]
    fn test_driver_with_token_is_eligible() {
        let record = make_record(Role::Driver, Some("tok123"));
        assert!(is_eligible(&record, &Role::Driver));
        assert_eq!(check(&record, &Role::Driver), Ok("tok123"));
    }

    #[test]
    fn test_wrong_role() {
        let record = make_record(Role::Customer, Some("tok123"));
        assert_eq!(check(&record, &Role::Driver), Err(SkipReason::IneligibleRole));
    }

    #[test]
    fn test_role_match_is_case_sensitive() {
        let record = make_record("driver".parse().unwrap(), Some("tok123"));
        assert_eq!(check(&record, &Role::Driver), Err(SkipReason::IneligibleRole));
    }

    #[test]
    fn test_wrong_role_wins_over_missing_token() {
        let record = make_record(Role::Admin, None);
        assert_eq!(check(&record, &Role::Driver), Err(SkipReason::IneligibleRole));
    }

    #[test]
    fn test_missing_or_blank_token() {
        assert_eq!(
            check(&make_record(Role::Driver, None), &Role::Driver),
            Err(SkipReason::NoToken)
        );
        assert_eq!(
            check(&make_record(Role::Driver, Some("")), &Role::Driver),
            Err(SkipReason::NoToken)
        );
        assert_eq!(
            check(&make_record(Role::Driver, Some("   ")), &Role::Driver),
            Err(SkipReason::NoToken)
        );
    }

    #[test]
    fn test_token_is_trimmed() {
        let record = make_record(Role::Driver, Some(" tok123\n"));
        assert_eq!(check(&record, &Role::Driver), Ok("tok123"));
    }

    #[test]
    fn test_configured_role() {
        let role = Role::Other("Courier".to_string());
        let record = make_record(role.clone(), Some("tok"));
        assert!(is_eligible(&record, &role));
        assert!(!is_eligible(&record, &Role::Driver));
    }
}
