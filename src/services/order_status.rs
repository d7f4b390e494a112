//! Order fulfillment state machine.
//!
//! `pending -> preparing -> on-the-way -> delivered`, forward only (steps may be
//! skipped). `cancelled` is entered only through the cancel operation.
//! `delivered` and `cancelled` are terminal.

use crate::auth::Role;
use crate::entities::order::OrderStatus;

fn rank(status: OrderStatus) -> Option<u8> {
    match status {
        OrderStatus::Pending => Some(0),
        OrderStatus::Preparing => Some(1),
        OrderStatus::OnTheWay => Some(2),
        OrderStatus::Delivered => Some(3),
        OrderStatus::Cancelled => None,
    }
}

/// Whether `update_status` may move an order from `from` to `to`.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    match (rank(from), rank(to)) {
        (Some(a), Some(b)) => b > a,
        _ => false,
    }
}

/// Whether a caller with `role` may cancel an order currently in `status`.
/// Ownership is checked separately.
pub fn can_cancel(role: Role, status: OrderStatus) -> bool {
    if status.is_terminal() {
        return false;
    }
    match role {
        Role::Customer => matches!(status, OrderStatus::Pending | OrderStatus::Preparing),
        Role::Vendor | Role::Admin => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use OrderStatus::*;

    #[rstest]
    #[case(Pending, Preparing, true)]
    #[case(Pending, OnTheWay, true)]
    #[case(Preparing, Delivered, true)]
    #[case(OnTheWay, Delivered, true)]
    #[case(Preparing, Pending, false)]
    #[case(Delivered, OnTheWay, false)]
    #[case(Delivered, Delivered, false)]
    #[case(Cancelled, Preparing, false)]
    #[case(Pending, Cancelled, false)]
    fn transitions(#[case] from: OrderStatus, #[case] to: OrderStatus, #[case] ok: bool) {
        assert_eq!(is_valid_transition(from, to), ok);
    }

    #[rstest]
    #[case(Role::Customer, Pending, true)]
    #[case(Role::Customer, Preparing, true)]
    #[case(Role::Customer, OnTheWay, false)]
    #[case(Role::Admin, OnTheWay, true)]
    #[case(Role::Vendor, OnTheWay, true)]
    #[case(Role::Admin, Delivered, false)]
    #[case(Role::Vendor, Cancelled, false)]
    fn cancellation_rules(#[case] role: Role, #[case] status: OrderStatus, #[case] ok: bool) {
        assert_eq!(can_cancel(role, status), ok);
    }
}
