//! Resource objects and their scalar projections
//!
//! A [`TmfObject`] is the cache's unit of storage: the full JSON payload
//! plus the scalar columns projected out of it (kind, lifecycle status,
//! owner and role identities). The payload is kept twice, as raw bytes
//! and as a decoded tree; the content hash is SHA-256 over the canonical
//! JSON serialization of the tree.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};
use crate::kinds::{self, DID_PREFIX};
use crate::tree;

/// Related-party roles projected onto scalar columns
const ROLE_FIELDS: &[&str] = &["Seller", "Buyer", "SellerOperator", "BuyerOperator"];

/// A resource object as held by the cache
#[derive(Debug, Clone, PartialEq)]
pub struct TmfObject {
    /// NGSI-LD identifier, `urn:ngsi-ld:<kebab-kind>:<uuid>`
    pub id: String,
    /// Payload version; part of the identity
    pub version: String,
    /// Resource kind, derived from the id against the kind table
    pub kind: String,
    pub name: String,
    pub description: String,
    pub lifecycle_status: String,
    pub last_update: String,
    /// Owner identity (`did:elsi:…`), stamped by the cloner or read from
    /// the payload
    pub organization_identifier: String,
    /// Id of the owning organization object
    pub organization: String,
    pub seller: String,
    pub buyer: String,
    pub seller_operator: String,
    pub buyer_operator: String,
    /// Decoded payload tree
    pub content: Value,
    /// Raw payload bytes as last received or serialized
    pub content_json: Vec<u8>,
    /// SHA-256 over the canonical JSON of `content`
    pub hash: Vec<u8>,
    /// Unix seconds of first cache write; owned by the store
    pub created: i64,
    /// Unix seconds of last cache write; owned by the store
    pub updated: i64,
}

/// Operator restrictions declared in `productOfferingTerm` entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorRestrictions {
    pub permitted_countries: Vec<String>,
    pub prohibited_countries: Vec<String>,
    pub permitted_operators: Vec<String>,
    pub prohibited_operators: Vec<String>,
}

impl TmfObject {
    /// Build an object from raw payload bytes
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let content: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::BadRequest(format!("payload is not JSON: {e}")))?;
        let mut obj = Self::from_value(content)?;
        obj.content_json = raw.to_vec();
        Ok(obj)
    }

    /// Build an object from a decoded payload tree
    ///
    /// The id must be a well-formed NGSI-LD identifier of a known kind and
    /// must agree with the payload's `href` when one is present.
    pub fn from_value(content: Value) -> Result<Self> {
        let id = tree::lookup_string(&content, "id");
        if id.is_empty() {
            return Err(GatewayError::BadRequest("payload has no id".into()));
        }
        let kind = kinds::kind_of_id(&id)
            .ok_or_else(|| GatewayError::BadRequest(format!("unknown resource kind in id {id:?}")))?
            .to_string();

        let href = tree::lookup_string(&content, "href");
        if !href.is_empty() && href != id {
            return Err(GatewayError::BadRequest(format!(
                "id {id:?} does not match href {href:?}"
            )));
        }

        let mut obj = Self {
            id,
            version: tree::lookup_string(&content, "version"),
            kind,
            name: tree::lookup_string(&content, "name"),
            description: tree::lookup_string(&content, "description"),
            lifecycle_status: tree::lookup_string(&content, "lifecycleStatus"),
            last_update: tree::lookup_string(&content, "lastUpdate"),
            organization_identifier: String::new(),
            organization: String::new(),
            seller: String::new(),
            buyer: String::new(),
            seller_operator: String::new(),
            buyer_operator: String::new(),
            content: Value::Null,
            content_json: Vec::new(),
            hash: Vec::new(),
            created: 0,
            updated: 0,
        };

        // Categories are shared tree nodes and carry no ownership.
        if obj.kind != "category" {
            obj.organization_identifier = tree::lookup_string(&content, "organizationIdentifier");
            obj.organization = tree::lookup_string(&content, "organization");
            let roles = extract_roles(&content);
            obj.seller = roles[0].clone();
            obj.buyer = roles[1].clone();
            obj.seller_operator = roles[2].clone();
            obj.buyer_operator = roles[3].clone();
        }

        obj.set_content(content);
        Ok(obj)
    }

    /// Replace the payload tree, refreshing the raw bytes and the hash
    pub fn set_content(&mut self, content: Value) {
        self.content_json =
            serde_json::to_vec(&content).expect("JSON tree serialization cannot fail");
        self.hash = canonical_hash(&content);
        self.content = content;
    }

    /// Write a scalar field into the payload tree and refresh bytes + hash
    pub fn stamp(&mut self, key: &str, value: &str) {
        let mut content = std::mem::replace(&mut self.content, Value::Null);
        if let Value::Object(ref mut map) = content {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        match key {
            "organizationIdentifier" => self.organization_identifier = value.to_string(),
            "organization" => self.organization = value.to_string(),
            _ => {}
        }
        self.set_content(content);
    }

    /// Hex-encoded content hash, used as the HTTP `ETag`
    pub fn etag(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Whether a normalized `did:elsi:` identity holds any of the four
    /// role positions on this object
    pub fn has_role(&self, did: &str) -> bool {
        !did.is_empty()
            && [&self.seller, &self.buyer, &self.seller_operator, &self.buyer_operator]
                .iter()
                .any(|r| r.as_str() == did)
    }

    /// Mandatory payload fields for CREATE
    pub fn validate_mandatory(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("lifecycleStatus", &self.lifecycle_status),
        ] {
            if value.is_empty() {
                return Err(GatewayError::BadRequest(format!(
                    "mandatory field {field:?} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Gather operator restrictions from `productOfferingTerm` entries of
    /// type `OperatorRestriction`
    pub fn restrictions(&self) -> OperatorRestrictions {
        let mut out = OperatorRestrictions::default();
        let Ok(Some(Value::Array(terms))) = tree::lookup(&self.content, "productOfferingTerm")
        else {
            return out;
        };
        for term in terms {
            let ty = tree::lookup_string(term, "@type");
            let name = tree::lookup_string(term, "name");
            if !ty.eq_ignore_ascii_case("OperatorRestriction")
                && !name.eq_ignore_ascii_case("OperatorRestriction")
            {
                continue;
            }
            out.permitted_countries
                .extend(term_values(term, "permittedCountries"));
            out.prohibited_countries
                .extend(term_values(term, "prohibitedCountries"));
            out.permitted_operators
                .extend(term_values(term, "permittedOperators"));
            out.prohibited_operators
                .extend(term_values(term, "prohibitedOperators"));
        }
        out
    }
}

/// SHA-256 over the canonical (sorted-key) JSON serialization of a tree
pub fn canonical_hash(content: &Value) -> Vec<u8> {
    let canonical = serde_json::to_vec(content).expect("JSON tree serialization cannot fail");
    Sha256::digest(&canonical).to_vec()
}

/// Resolve the display name of a related-party entry
///
/// Entries carry the identity either directly (`name`) or through the
/// party reference (`partyOrPartyRole.name`).
fn party_name(entry: &Value) -> String {
    let direct = tree::lookup_string(entry, "name");
    if !direct.is_empty() {
        return direct;
    }
    tree::lookup_string(entry, "partyOrPartyRole.name")
}

/// Extract `[seller, buyer, sellerOperator, buyerOperator]` identities
/// from the payload's `relatedParty` list
fn extract_roles(content: &Value) -> [String; 4] {
    let mut out: [String; 4] = Default::default();
    let Ok(Some(Value::Array(parties))) = tree::lookup(content, "relatedParty") else {
        return out;
    };
    for entry in parties {
        let role = tree::lookup_string(entry, "role");
        let name = party_name(entry);
        if !name.starts_with(DID_PREFIX) {
            continue;
        }
        for (i, wanted) in ROLE_FIELDS.iter().enumerate() {
            if role.eq_ignore_ascii_case(wanted) && out[i].is_empty() {
                out[i] = name.clone();
            }
        }
    }
    out
}

/// Values of a restriction field, accepting an array of strings or a
/// single comma-separated string
fn term_values(term: &Value, key: &str) -> Vec<String> {
    match tree::lookup(term, key) {
        Ok(Some(Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Ok(Some(Value::String(s))) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Complete a CREATE payload's `relatedParty` list for the caller
///
/// Guarantees a `Seller` and a `SellerOperator` entry naming the caller's
/// organization; existing entries of either role are left untouched.
pub fn ensure_related_parties(body: &mut Value, org_did: &str) {
    let Value::Object(map) = body else { return };
    let parties = map
        .entry("relatedParty".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(entries) = parties else { return };

    for wanted in ["Seller", "SellerOperator"] {
        let present = entries.iter().any(|e| {
            tree::lookup_string(e, "role").eq_ignore_ascii_case(wanted)
        });
        if !present {
            let mut entry = Map::new();
            entry.insert("role".into(), json!(wanted));
            entry.insert(
                "partyOrPartyRole".into(),
                json!({"@type": "PartyRef", "name": org_did}),
            );
            entry.insert("@type".into(), json!("RelatedPartyRefOrPartyRoleRef"));
            entries.push(Value::Object(entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offering() -> Value {
        json!({
            "id": "urn:ngsi-ld:product-offering:A",
            "href": "urn:ngsi-ld:product-offering:A",
            "name": "Compute Bundle",
            "version": "0.1",
            "description": "A bundle",
            "lifecycleStatus": "Launched",
            "lastUpdate": "2026-01-10T12:00:00Z",
            "relatedParty": [
                {"role": "Seller", "name": "did:elsi:VATES-B60645900"},
                {"role": "SellerOperator", "partyOrPartyRole": {"name": "did:elsi:VATES-OP"}},
                {"role": "Buyer", "name": "unprefixed-identity"}
            ],
            "productOfferingTerm": [
                {
                    "@type": "OperatorRestriction",
                    "permittedCountries": ["ES", "DE"],
                    "prohibitedOperators": "did:elsi:X, did:elsi:Y"
                },
                {"name": "other term"}
            ]
        })
    }

    #[test]
    fn test_from_value_projections() {
        let obj = TmfObject::from_value(offering()).unwrap();
        assert_eq!(obj.kind, "productOffering");
        assert_eq!(obj.name, "Compute Bundle");
        assert_eq!(obj.version, "0.1");
        assert_eq!(obj.lifecycle_status, "Launched");
        assert_eq!(obj.seller, "did:elsi:VATES-B60645900");
        assert_eq!(obj.seller_operator, "did:elsi:VATES-OP");
        // Buyer identity lacks the did prefix and is not projected.
        assert_eq!(obj.buyer, "");
        assert_eq!(obj.buyer_operator, "");
    }

    #[test]
    fn test_hash_matches_canonical_serialization() {
        let obj = TmfObject::from_value(offering()).unwrap();
        assert_eq!(obj.hash, canonical_hash(&obj.content));
        assert_eq!(obj.etag(), hex::encode(&obj.hash));
        assert_eq!(obj.hash.len(), 32);
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let a = TmfObject::from_value(json!({
            "id": "urn:ngsi-ld:catalog:1", "name": "n", "version": "1"
        }))
        .unwrap();
        let b = TmfObject::from_value(json!({
            "version": "1", "name": "n", "id": "urn:ngsi-ld:catalog:1"
        }))
        .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_stamp_refreshes_hash_and_bytes() {
        let mut obj = TmfObject::from_value(offering()).unwrap();
        let before = obj.hash.clone();
        obj.stamp("organizationIdentifier", "did:elsi:ORG-42");
        assert_ne!(obj.hash, before);
        assert_eq!(obj.organization_identifier, "did:elsi:ORG-42");
        let reparsed: Value = serde_json::from_slice(&obj.content_json).unwrap();
        assert_eq!(
            reparsed["organizationIdentifier"],
            json!("did:elsi:ORG-42")
        );
    }

    #[test]
    fn test_category_has_no_owner_fields() {
        let obj = TmfObject::from_value(json!({
            "id": "urn:ngsi-ld:category:9",
            "name": "root",
            "organizationIdentifier": "did:elsi:SHOULD-BE-IGNORED",
            "relatedParty": [{"role": "Seller", "name": "did:elsi:A"}]
        }))
        .unwrap();
        assert_eq!(obj.organization_identifier, "");
        assert_eq!(obj.seller, "");
    }

    #[test]
    fn test_href_mismatch_rejected() {
        let err = TmfObject::from_value(json!({
            "id": "urn:ngsi-ld:catalog:1",
            "href": "urn:ngsi-ld:catalog:2"
        }))
        .unwrap_err();
        assert_eq!(err.code(), "bad-request");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err =
            TmfObject::from_value(json!({"id": "urn:ngsi-ld:flux-capacitor:1"})).unwrap_err();
        assert_eq!(err.code(), "bad-request");
    }

    #[test]
    fn test_restrictions() {
        let obj = TmfObject::from_value(offering()).unwrap();
        let r = obj.restrictions();
        assert_eq!(r.permitted_countries, vec!["ES", "DE"]);
        assert_eq!(r.prohibited_operators, vec!["did:elsi:X", "did:elsi:Y"]);
        assert!(r.permitted_operators.is_empty());
        assert!(r.prohibited_countries.is_empty());
    }

    #[test]
    fn test_has_role() {
        let obj = TmfObject::from_value(offering()).unwrap();
        assert!(obj.has_role("did:elsi:VATES-B60645900"));
        assert!(obj.has_role("did:elsi:VATES-OP"));
        assert!(!obj.has_role("did:elsi:OTHER"));
        assert!(!obj.has_role(""));
    }

    #[test]
    fn test_ensure_related_parties_empty() {
        let mut body = json!({"name": "X"});
        ensure_related_parties(&mut body, "did:elsi:ME");
        let parties = body["relatedParty"].as_array().unwrap();
        assert_eq!(parties.len(), 2);
        assert_eq!(parties[0]["role"], json!("Seller"));
        assert_eq!(parties[0]["partyOrPartyRole"]["name"], json!("did:elsi:ME"));
        assert_eq!(parties[1]["role"], json!("SellerOperator"));
    }

    #[test]
    fn test_ensure_related_parties_partial() {
        let mut body = json!({
            "relatedParty": [{"role": "Seller", "name": "did:elsi:ME"}]
        });
        ensure_related_parties(&mut body, "did:elsi:ME");
        let parties = body["relatedParty"].as_array().unwrap();
        assert_eq!(parties.len(), 2);
        assert_eq!(parties[1]["role"], json!("SellerOperator"));
    }

    #[test]
    fn test_ensure_related_parties_complete_is_untouched() {
        let mut body = json!({
            "relatedParty": [
                {"role": "Seller", "name": "did:elsi:ME"},
                {"role": "SellerOperator", "name": "did:elsi:ME"}
            ]
        });
        let before = body.clone();
        ensure_related_parties(&mut body, "did:elsi:ME");
        assert_eq!(body, before);
    }
}
