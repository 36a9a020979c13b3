use std::collections::HashSet;

/// Decides which SKUs are exempt from inventory tracking.
pub trait SkuAvailability: Send + Sync {
    fn is_always_available(&self, sku_code: &str) -> bool;
}

/// Fixed set of always-available SKU codes, usually taken from config.
#[derive(Debug, Clone, Default)]
pub struct AlwaysAvailableSkus {
    skus: HashSet<String>,
}

impl AlwaysAvailableSkus {
    pub fn new<I, S>(skus: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skus: skus.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.skus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skus.is_empty()
    }
}

impl SkuAvailability for AlwaysAvailableSkus {
    fn is_always_available(&self, sku_code: &str) -> bool {
        self.skus.contains(sku_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_skus_are_exempt() {
        let exempt = AlwaysAvailableSkus::new(["GIFT-CARD", "E-BOOK"]);
        assert!(exempt.is_always_available("GIFT-CARD"));
        assert!(!exempt.is_always_available("gift-card"));
        assert!(!exempt.is_always_available("SKU-1"));
        assert_eq!(exempt.len(), 2);
    }

    #[test]
    fn default_exempts_nothing() {
        let exempt = AlwaysAvailableSkus::default();
        assert!(exempt.is_empty());
        assert!(!exempt.is_always_available("anything"));
    }
}
