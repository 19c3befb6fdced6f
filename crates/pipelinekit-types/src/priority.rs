use std::fmt;

/// Where a middleware fires in the chain relative to its peers.
///
/// Ordered by declaration position (`Authentication` first,
/// `Observability`/`Custom` last); ties within the same tier are broken by
/// registration order, per spec.md §4.7. `Custom` carries an explicit rank
/// so callers can interleave with the named tiers when the fixed ordering
/// doesn't fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MiddlewarePriority {
    Authentication,
    Validation,
    Resilience,
    Processing,
    PostProcessing,
    Observability,
    Custom(i32),
}

impl fmt::Display for MiddlewarePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Validation => write!(f, "validation"),
            Self::Resilience => write!(f, "resilience"),
            Self::Processing => write!(f, "processing"),
            Self::PostProcessing => write!(f, "post_processing"),
            Self::Observability => write!(f, "observability"),
            Self::Custom(rank) => write!(f, "custom({rank})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_tiers_order_as_declared() {
        assert!(MiddlewarePriority::Authentication < MiddlewarePriority::Validation);
        assert!(MiddlewarePriority::Validation < MiddlewarePriority::Resilience);
        assert!(MiddlewarePriority::Resilience < MiddlewarePriority::Processing);
        assert!(MiddlewarePriority::Processing < MiddlewarePriority::PostProcessing);
        assert!(MiddlewarePriority::PostProcessing < MiddlewarePriority::Observability);
    }

    #[test]
    fn custom_sorts_after_named_tiers_by_declaration_order() {
        assert!(MiddlewarePriority::Observability < MiddlewarePriority::Custom(0));
        assert!(MiddlewarePriority::Custom(0) < MiddlewarePriority::Custom(1));
    }
}
