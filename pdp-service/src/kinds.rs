//! Static resource-kind tables
//!
//! Two tables are kept in sync with the upstream TMF API definitions: the
//! kind table mapping the kebab-case segment of an NGSI-LD identifier to
//! its camelCase resource name, and the prefix table mapping a resource
//! to the API family it is served under. Both are configuration; unknown
//! kinds are rejected rather than guessed.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Identifier prefix shared by every resource object
pub const URN_PREFIX: &str = "urn:ngsi-ld:";

/// Identity prefix for organization identifiers
pub const DID_PREFIX: &str = "did:elsi:";

/// (kebab id segment, camelCase resource, API family) per known kind
const KIND_TABLE: &[(&str, &str, &str)] = &[
    ("catalog", "catalog", "productCatalogManagement"),
    ("category", "category", "productCatalogManagement"),
    ("product-offering", "productOffering", "productCatalogManagement"),
    ("product-offering-price", "productOfferingPrice", "productCatalogManagement"),
    ("product-specification", "productSpecification", "productCatalogManagement"),
    ("product-order", "productOrder", "productOrderingManagement"),
    ("product", "product", "productInventory"),
    ("service-specification", "serviceSpecification", "serviceCatalogManagement"),
    ("resource-specification", "resourceSpecification", "resourceCatalogManagement"),
    ("organization", "organization", "party"),
    ("individual", "individual", "party"),
    ("agreement", "agreement", "agreementManagement"),
    ("agreement-specification", "agreementSpecification", "agreementManagement"),
    ("usage", "usage", "usageManagement"),
    ("usage-specification", "usageSpecification", "usageManagement"),
    ("billing-account", "billingAccount", "accountManagement"),
    ("quote", "quote", "quoteManagement"),
];

static KEBAB_TO_CAMEL: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| KIND_TABLE.iter().map(|(k, c, _)| (*k, *c)).collect());

static CAMEL_TO_KEBAB: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| KIND_TABLE.iter().map(|(k, c, _)| (*c, *k)).collect());

static CAMEL_TO_API: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| KIND_TABLE.iter().map(|(_, c, a)| (*c, *a)).collect());

/// camelCase resource name for a kebab id segment, if known
pub fn camel_kind(kebab: &str) -> Option<&'static str> {
    KEBAB_TO_CAMEL.get(kebab).copied()
}

/// Kebab id segment for a camelCase resource name, if known
pub fn kebab_kind(camel: &str) -> Option<&'static str> {
    CAMEL_TO_KEBAB.get(camel).copied()
}

/// API family a resource is served under, if known
pub fn api_family(camel: &str) -> Option<&'static str> {
    CAMEL_TO_API.get(camel).copied()
}

/// Derive the resource kind from an NGSI-LD identifier
///
/// `urn:ngsi-ld:product-offering:1234` yields `productOffering`. The kind
/// is always derived here, never trusted from the payload.
pub fn kind_of_id(id: &str) -> Option<&'static str> {
    let rest = id.strip_prefix(URN_PREFIX)?;
    let (segment, _uuid) = rest.split_once(':')?;
    camel_kind(segment)
}

/// Whether an identifier has the `urn:ngsi-ld:<kebab>:<suffix>` shape with
/// a known kind
pub fn is_valid_id(id: &str) -> bool {
    kind_of_id(id).is_some()
}

/// Mint a fresh identifier for a resource
pub fn mint_id(resource: &str) -> Option<String> {
    let kebab = kebab_kind(resource)?;
    Some(format!("{URN_PREFIX}{kebab}:{}", uuid::Uuid::new_v4()))
}

/// Normalize an organization identifier to its `did:elsi:` form
///
/// Identities arrive with or without the prefix; all comparisons use the
/// prefixed form.
pub fn normalize_did(org: &str) -> String {
    if org.is_empty() || org.starts_with(DID_PREFIX) {
        org.to_string()
    } else {
        format!("{DID_PREFIX}{org}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_id() {
        assert_eq!(
            kind_of_id("urn:ngsi-ld:product-offering:7f1e"),
            Some("productOffering")
        );
        assert_eq!(kind_of_id("urn:ngsi-ld:catalog:1"), Some("catalog"));
        assert_eq!(kind_of_id("urn:ngsi-ld:mystery-thing:1"), None);
        assert_eq!(kind_of_id("urn:other:catalog:1"), None);
        assert_eq!(kind_of_id("catalog"), None);
    }

    #[test]
    fn test_kebab_camel_round_trip() {
        for (kebab, camel, _) in KIND_TABLE {
            assert_eq!(camel_kind(kebab), Some(*camel));
            assert_eq!(kebab_kind(camel), Some(*kebab));
        }
    }

    #[test]
    fn test_api_family() {
        assert_eq!(api_family("productOffering"), Some("productCatalogManagement"));
        assert_eq!(api_family("organization"), Some("party"));
        assert_eq!(api_family("unknownThing"), None);
    }

    #[test]
    fn test_mint_id_shape() {
        let id = mint_id("productOffering").unwrap();
        assert!(id.starts_with("urn:ngsi-ld:product-offering:"));
        assert_eq!(kind_of_id(&id), Some("productOffering"));
        assert!(mint_id("noSuchResource").is_none());
    }

    #[test]
    fn test_normalize_did() {
        assert_eq!(normalize_did("VATES-B60645900"), "did:elsi:VATES-B60645900");
        assert_eq!(
            normalize_did("did:elsi:VATES-B60645900"),
            "did:elsi:VATES-B60645900"
        );
        assert_eq!(normalize_did(""), "");
    }
}
