//! Polymorphism over socket patterns (C6 support): a tagged discriminant plus a static table,
//! no subclassing — see `SPEC_FULL.md` §9 and the `scaproust` reference file's `SocketType`
//! enum, which this module's shape and per-variant doc-comment style is grounded in.

/// The default ceiling used wherever the distilled spec says "1..MAX" or "0..MAX" peerings.
/// Unlike `scaproust`'s reference, nothing in this crate needs an unbounded ceiling: a real
/// limit is what makes "max peerings reached for socket" ROTFL rejections actually reachable.
pub const DEFAULT_MAX_PEERINGS: usize = 64;

/// How a vocket dispatches one outbound application message, per `§4.4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Outbound is rejected and logged; this pattern never sends.
    None,
    /// Round-robin to the next live peering, tracking a `request` slot and sequence number.
    Request,
    /// Send to the `reply_to` peering only, caching the body for duplicate-request echo.
    Reply,
    /// Round-robin to the next live peering, no request/reply bookkeeping.
    Dealer,
    /// Route by the scheme-qualified identity frame prepended to the message.
    Router,
    /// Fan out to every live peering.
    Publish,
    /// Send to the single permitted peering.
    Single,
}

/// The per-pattern constants that drive routing, inbound acceptance, and peering bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatternTraits {
    pub routing: RoutingPolicy,
    /// Whether this pattern accepts inbound NOM bodies at all (`§4.4`'s "others" fallback).
    pub nomnom: bool,
    pub min_peerings: usize,
    pub max_peerings: usize,
}

/// The nine messaging socket patterns this crate emulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Sends one request at a time, round-robin over live peerings; waits for a matching reply
    /// before reusing a peering's request slot.
    Request,
    /// Answers the peering that sent the most recent request, caching the reply so a duplicate
    /// (same sequence) request is answered without reaching the application twice.
    Reply,
    /// Routes outbound messages by a scheme-qualified identity frame; accepts any number of
    /// peerings down to zero.
    Router,
    /// Round-robins outbound messages with no request/reply bookkeeping.
    Dealer,
    /// Fans out every outbound message to all live peerings; never accepts inbound.
    Publish,
    /// Receives every message a connected `Publish` peer sends; never sends.
    Subscribe,
    /// Round-robins outbound messages to a pool of downstream workers; never receives.
    Push,
    /// Receives load-balanced messages from one or more `Push` peers; never sends.
    Pull,
    /// Exactly one peering, bidirectional.
    Pair,
}

impl SocketType {
    /// The static routing/acceptance/peering-bound table for this pattern, per `§4.4`/`§9`.
    pub fn traits(&self) -> PatternTraits {
        match self {
            SocketType::Request => PatternTraits {
                routing: RoutingPolicy::Request,
                nomnom: true,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Reply => PatternTraits {
                routing: RoutingPolicy::Reply,
                nomnom: true,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Router => PatternTraits {
                routing: RoutingPolicy::Router,
                nomnom: true,
                min_peerings: 0,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Dealer => PatternTraits {
                routing: RoutingPolicy::Dealer,
                nomnom: true,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Publish => PatternTraits {
                routing: RoutingPolicy::Publish,
                nomnom: false,
                min_peerings: 0,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Subscribe => PatternTraits {
                routing: RoutingPolicy::None,
                nomnom: true,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Push => PatternTraits {
                routing: RoutingPolicy::Dealer,
                nomnom: false,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Pull => PatternTraits {
                routing: RoutingPolicy::None,
                nomnom: true,
                min_peerings: 1,
                max_peerings: DEFAULT_MAX_PEERINGS,
            },
            SocketType::Pair => PatternTraits {
                routing: RoutingPolicy::Single,
                nomnom: true,
                min_peerings: 1,
                max_peerings: 1,
            },
        }
    }

    /// The socket type expected on the other end of a peering, if this pattern has exactly one
    /// (as `scaproust` defines for its own socket types); `Router`/`Dealer` tolerate either end.
    pub fn peer(&self) -> Option<SocketType> {
        match self {
            SocketType::Request => Some(SocketType::Reply),
            SocketType::Reply => Some(SocketType::Request),
            SocketType::Publish => Some(SocketType::Subscribe),
            SocketType::Subscribe => Some(SocketType::Publish),
            SocketType::Push => Some(SocketType::Pull),
            SocketType::Pull => Some(SocketType::Push),
            SocketType::Pair => Some(SocketType::Pair),
            SocketType::Router | SocketType::Dealer => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_exactly_one_peering() {
        let t = SocketType::Pair.traits();
        assert_eq!(t.min_peerings, 1);
        assert_eq!(t.max_peerings, 1);
    }

    #[test]
    fn router_and_publish_allow_zero_peerings() {
        assert_eq!(SocketType::Router.traits().min_peerings, 0);
        assert_eq!(SocketType::Publish.traits().min_peerings, 0);
    }

    #[test]
    fn publish_and_push_do_not_accept_inbound() {
        assert!(!SocketType::Publish.traits().nomnom);
        assert!(!SocketType::Push.traits().nomnom);
    }

    #[test]
    fn request_and_reply_are_mutual_peers() {
        assert_eq!(SocketType::Request.peer(), Some(SocketType::Reply));
        assert_eq!(SocketType::Reply.peer(), Some(SocketType::Request));
    }

    #[test]
    fn router_and_dealer_have_no_single_fixed_peer() {
        assert_eq!(SocketType::Router.peer(), None);
        assert_eq!(SocketType::Dealer.peer(), None);
    }
}
