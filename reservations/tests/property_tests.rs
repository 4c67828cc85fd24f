//! Property-based tests over pure domain logic: queue-pass authenticity
//! (P4/P5) and booking terminal-state monotonicity (P6).
//!
//! These avoid any live Postgres/Redis dependency; see `tests/scenarios.rs`
//! for the infrastructure-backed scenarios.

use proptest::prelude::*;
use reservations::jwt::{QueuePassJwtError, QueuePassSigner};
use reservations::server::error::AppError;
use reservations::types::{BookingStatus, EventId, UserId};

proptest! {
    #[test]
    fn pass_signed_with_one_secret_is_rejected_by_another(
        secret_a in "[a-zA-Z0-9]{16,32}",
        secret_b in "[a-zA-Z0-9]{16,32}",
    ) {
        prop_assume!(secret_a != secret_b);

        let signer_a = QueuePassSigner::new(&secret_a, "reservations", 120);
        let signer_b = QueuePassSigner::new(&secret_b, "reservations", 120);

        let user_id = UserId::new();
        let event_id = EventId::new();
        let token = signer_a.sign(user_id, event_id).expect("sign");

        let result = signer_b.validate(&token);
        prop_assert!(matches!(result, Err(QueuePassJwtError::Invalid(_))));
    }

    #[test]
    fn pass_round_trips_its_claims_under_any_valid_secret(
        secret in "[a-zA-Z0-9]{16,32}",
        ttl_seconds in 1i64..86_400,
    ) {
        let signer = QueuePassSigner::new(&secret, "reservations", ttl_seconds);
        let user_id = UserId::new();
        let event_id = EventId::new();

        let token = signer.sign(user_id, event_id).expect("sign");
        let claims = signer.validate(&token).expect("validate");

        prop_assert_eq!(claims.user_id, user_id);
        prop_assert_eq!(claims.event_id, event_id);
    }

    #[test]
    fn expired_pass_is_never_accepted(
        secret in "[a-zA-Z0-9]{16,32}",
    ) {
        // A negative TTL mints a token whose `exp` is already in the past.
        let signer = QueuePassSigner::new(&secret, "reservations", -1);
        let token = signer.sign(UserId::new(), EventId::new()).expect("sign");

        let result = signer.validate(&token);
        prop_assert!(matches!(result, Err(QueuePassJwtError::Expired)));
    }
}

fn any_status() -> impl Strategy<Value = BookingStatus> {
    prop_oneof![
        Just(BookingStatus::Reserved),
        Just(BookingStatus::Confirmed),
        Just(BookingStatus::Cancelled),
        Just(BookingStatus::Expired),
    ]
}

proptest! {
    #[test]
    fn terminal_status_never_maps_to_a_success_response(status in any_status()) {
        if status.is_terminal() {
            let err = reservations::reservation_service::ReservationServiceError::AlreadyTerminal(status);
            let app_err: AppError = err.into();
            prop_assert!(!app_err.status().is_success());
        }
    }

    #[test]
    fn only_reserved_is_non_terminal(status in any_status()) {
        prop_assert_eq!(status.is_terminal(), status != BookingStatus::Reserved);
    }
}
