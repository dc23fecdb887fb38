//! Policy input assembly
//!
//! Every evaluation receives one JSON tree with exactly four blocks:
//! `request` (the parsed proxied request), `token` (verified claims),
//! `tmf` (the resource under decision plus derived operator-restriction
//! arrays) and `user` (convenience attributes precomputed for policy
//! authors).

use serde_json::{json, Map, Value};

use crate::kinds;
use crate::object::TmfObject;
use crate::request::ProxiedRequest;
use crate::token;

/// Build the `input` tree for one decision
///
/// `obj` is the cached or incoming object; absent for decisions that have
/// no resource in hand.
pub fn build_input(req: &ProxiedRequest, claims: &Value, obj: Option<&TmfObject>) -> Value {
    json!({
        "request": request_block(req),
        "token": claims.clone(),
        "tmf": tmf_block(obj),
        "user": user_block(claims, obj),
    })
}

fn request_block(req: &ProxiedRequest) -> Value {
    let mut block = Map::new();
    block.insert("action".into(), json!(req.action.as_str()));
    block.insert("method".into(), json!(req.method));
    block.insert("host".into(), json!(req.host));
    block.insert("remote_addr".into(), json!(req.remote_addr));
    block.insert("path".into(), json!(req.path));
    block.insert("query".into(), json!(req.query));
    block.insert("api".into(), json!(req.api));
    block.insert("resource".into(), json!(req.resource));
    if let Some(ref id) = req.id {
        block.insert("id".into(), json!(id));
    }
    Value::Object(block)
}

fn tmf_block(obj: Option<&TmfObject>) -> Value {
    let Some(obj) = obj else {
        return Value::Object(Map::new());
    };
    let mut block = match &obj.content {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("content".into(), other.clone());
            map
        }
    };
    let restrictions = obj.restrictions();
    block.insert(
        "permittedCountries".into(),
        json!(restrictions.permitted_countries),
    );
    block.insert(
        "prohibitedCountries".into(),
        json!(restrictions.prohibited_countries),
    );
    block.insert(
        "permittedOperators".into(),
        json!(restrictions.permitted_operators),
    );
    block.insert(
        "prohibitedOperators".into(),
        json!(restrictions.prohibited_operators),
    );
    Value::Object(block)
}

fn user_block(claims: &Value, obj: Option<&TmfObject>) -> Value {
    let org = kinds::normalize_did(&token::organization_identifier(claims));

    let (is_seller, is_seller_operator, is_buyer, is_buyer_operator) = match obj {
        Some(obj) if !org.is_empty() => (
            obj.seller == org,
            obj.seller_operator == org,
            obj.buyer == org,
            obj.buyer_operator == org,
        ),
        _ => (false, false, false, false),
    };

    json!({
        "isAuthenticated": token::is_authenticated(claims),
        "isLEAR": token::is_lear(claims),
        "isOwner": is_seller || is_seller_operator,
        "isSeller": is_seller,
        "isSellerOperator": is_seller_operator,
        "isBuyer": is_buyer,
        "isBuyerOperator": is_buyer_operator,
        "organizationIdentifier": org,
        "country": token::country(claims),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method, Uri};

    fn sample_request() -> ProxiedRequest {
        let method: Method = "GET".parse().unwrap();
        let uri: Uri =
            "/tmf-api/productCatalogManagement/v4/productOffering/urn:ngsi-ld:product-offering:A?x=1"
                .parse()
                .unwrap();
        ProxiedRequest::parse(&method, &uri, &HeaderMap::new(), false).unwrap()
    }

    fn sample_object(seller: &str) -> TmfObject {
        TmfObject::from_value(json!({
            "id": "urn:ngsi-ld:product-offering:A",
            "name": "X",
            "version": "0.1",
            "lifecycleStatus": "Launched",
            "relatedParty": [
                {"role": "Seller", "name": seller},
                {"role": "Buyer", "name": "did:elsi:BUYER"}
            ],
            "productOfferingTerm": [{
                "@type": "OperatorRestriction",
                "permittedCountries": ["ES"]
            }]
        }))
        .unwrap()
    }

    fn claims_for(org: &str) -> Value {
        json!({
            "vc": {
                "credentialSubject": {
                    "mandate": {
                        "mandator": {"organizationIdentifier": org, "country": "ES"}
                    }
                }
            }
        })
    }

    #[test]
    fn test_four_blocks_present() {
        let input = build_input(&sample_request(), &json!({}), None);
        let top = input.as_object().unwrap();
        assert_eq!(top.len(), 4);
        for key in ["request", "token", "tmf", "user"] {
            assert!(top.contains_key(key), "missing block {key}");
        }
    }

    #[test]
    fn test_request_block() {
        let input = build_input(&sample_request(), &json!({}), None);
        let request = &input["request"];
        assert_eq!(request["action"], json!("READ"));
        assert_eq!(request["resource"], json!("productOffering"));
        assert_eq!(request["id"], json!("urn:ngsi-ld:product-offering:A"));
        assert_eq!(request["query"]["x"], json!(["1"]));
        assert_eq!(request["path"][0], json!("tmf-api"));
    }

    #[test]
    fn test_tmf_block_carries_restrictions() {
        let obj = sample_object("did:elsi:OWNER");
        let input = build_input(&sample_request(), &json!({}), Some(&obj));
        assert_eq!(input["tmf"]["permittedCountries"], json!(["ES"]));
        assert_eq!(input["tmf"]["prohibitedOperators"], json!([]));
        assert_eq!(input["tmf"]["lifecycleStatus"], json!("Launched"));
    }

    #[test]
    fn test_user_block_owner() {
        let obj = sample_object("did:elsi:OWNER");
        let claims = claims_for("did:elsi:OWNER");
        let input = build_input(&sample_request(), &claims, Some(&obj));
        let user = &input["user"];
        assert_eq!(user["isAuthenticated"], json!(true));
        assert_eq!(user["isOwner"], json!(true));
        assert_eq!(user["isSeller"], json!(true));
        assert_eq!(user["isBuyer"], json!(false));
        assert_eq!(user["organizationIdentifier"], json!("did:elsi:OWNER"));
        assert_eq!(user["country"], json!("ES"));
    }

    #[test]
    fn test_user_block_unprefixed_org_is_normalized() {
        let obj = sample_object("did:elsi:OWNER");
        let claims = claims_for("OWNER");
        let input = build_input(&sample_request(), &claims, Some(&obj));
        assert_eq!(input["user"]["isOwner"], json!(true));
        assert_eq!(
            input["user"]["organizationIdentifier"],
            json!("did:elsi:OWNER")
        );
    }

    #[test]
    fn test_user_block_buyer() {
        let obj = sample_object("did:elsi:OWNER");
        let claims = claims_for("did:elsi:BUYER");
        let input = build_input(&sample_request(), &claims, Some(&obj));
        assert_eq!(input["user"]["isOwner"], json!(false));
        assert_eq!(input["user"]["isBuyer"], json!(true));
    }

    #[test]
    fn test_anonymous_user() {
        let obj = sample_object("did:elsi:OWNER");
        let input = build_input(&sample_request(), &json!({}), Some(&obj));
        let user = &input["user"];
        assert_eq!(user["isAuthenticated"], json!(false));
        assert_eq!(user["isOwner"], json!(false));
        assert_eq!(user["organizationIdentifier"], json!(""));
    }
}
