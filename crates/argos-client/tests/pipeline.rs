//! A full search through the real crawler and bundled adapters, with PubChem
//! and ClinicalTrials.gov served locally.

use argos_client::{ProviderTable, SourceEndpoints, crawler, http_strategies, pharma_orchestrator};
use argos_core::config::EngineConfig;
use argos_core::error::SourceErrorKind;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CID: &str = "67171867";

async fn mount_json(server: &MockServer, route: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_pubchem(server: &MockServer) {
    mount_json(
        server,
        "/rest/pug/compound/name/darolutamide/cids/JSON",
        json!({ "IdentifierList": { "CID": [67171867] } }),
    )
    .await;
    mount_json(
        server,
        &format!("/rest/pug/compound/cid/{CID}/synonyms/JSON"),
        json!({ "InformationList": { "Information": [{
            "CID": 67171867,
            "Synonym": ["darolutamide", "1297538-32-9", "ODM-201", "BAY-1841788", "Nubeqa", "CHEMBL3739243"]
        }] } }),
    )
    .await;
    mount_json(
        server,
        &format!("/rest/pug/compound/cid/{CID}/property/MolecularFormula,MolecularWeight,InChIKey,IUPACName/JSON"),
        json!({ "PropertyTable": { "Properties": [{
            "CID": 67171867,
            "MolecularFormula": "C19H19ClN6O2",
            "MolecularWeight": "398.8",
            "InChIKey": "BLIJXOOIHRSQRB-PXYINDEMSA-N"
        }] } }),
    )
    .await;
    mount_json(
        server,
        &format!("/rest/pug/compound/cid/{CID}/xrefs/PatentID/JSON"),
        json!({ "InformationList": { "Information": [{
            "CID": 67171867,
            "PatentID": ["US-2018155322-A1", "WO-2016162604-A1"]
        }] } }),
    )
    .await;
    mount_json(
        server,
        "/rest/pug_view/data/patent/WO-2016162604-A1/JSON",
        json!({ "Record": {
            "RecordAccession": "WO-2016162604-A1",
            "RecordTitle": "Crystalline form of darolutamide",
            "Section": [{
                "TOCHeading": "Abstract",
                "Information": [{ "Value": { "StringWithMarkup": [{ "String": "A new crystalline form." }] } }]
            }]
        } }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/rest/pug_view/data/patent/US-2018155322-A1/JSON"))
        .respond_with(ResponseTemplate::new(404).set_body_string("PUGVIEW.NotFound"))
        .mount(server)
        .await;
}

async fn mount_trials(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v2/studies"))
        .and(query_param("format", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "studies": [{
                "protocolSection": {
                    "identificationModule": { "nctId": "NCT02200614", "briefTitle": "ARAMIS" },
                    "statusModule": { "overallStatus": "COMPLETED" },
                    "designModule": { "phases": ["PHASE3"] },
                    "sponsorCollaboratorsModule": { "leadSponsor": { "name": "Bayer" } }
                }
            }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn search_merges_all_sources() {
    let server = MockServer::start().await;
    mount_pubchem(&server).await;
    mount_trials(&server).await;

    let config = EngineConfig::default();
    let fetcher = crawler(&config, http_strategies(true).unwrap());
    let endpoints = SourceEndpoints {
        pubchem: server.uri(),
        clinical_trials: format!("{}/api/v2", server.uri()),
    };
    let orchestrator =
        pharma_orchestrator(fetcher, &config, ProviderTable::default(), &endpoints).unwrap();

    let response = orchestrator.search("darolutamide").await;

    assert_eq!(response.subject.name, "darolutamide");
    assert_eq!(response.subject.codes, vec!["ODM-201", "BAY-1841788"]);
    assert_eq!(response.subject.identifiers["pubchem_cid"], CID);

    let records = &response.records;
    assert_eq!(records.molecules.len(), 1);
    assert_eq!(records.clinical_trials.len(), 1);
    assert_eq!(records.clinical_trials[0].identifier, "NCT02200614");
    assert_eq!(records.patents.len(), 1);
    assert_eq!(
        records.patents[0].title.as_deref(),
        Some("Crystalline form of darolutamide")
    );

    let meta = &response.metadata;
    assert_eq!(meta.expansions_performed, 2);
    assert!(meta.sources_succeeded.iter().any(|s| s == "clinicaltrials_gov"));
    assert!(meta.partial);
    assert_eq!(meta.errors.len(), 1);
    assert_eq!(meta.errors[0].source, "pubchem_patents");
    assert_eq!(meta.errors[0].kind, SourceErrorKind::Network);
}

#[tokio::test]
async fn unresolvable_query_still_searches_trials() {
    let server = MockServer::start().await;
    mount_trials(&server).await;

    let config = EngineConfig::default();
    let fetcher = crawler(&config, http_strategies(true).unwrap());
    let endpoints = SourceEndpoints {
        pubchem: server.uri(),
        clinical_trials: format!("{}/api/v2", server.uri()),
    };
    let orchestrator =
        pharma_orchestrator(fetcher, &config, ProviderTable::default(), &endpoints).unwrap();

    let response = orchestrator.search("ODM-201").await;

    assert_eq!(response.subject.name, "ODM-201");
    assert!(response.records.molecules.is_empty());
    assert_eq!(response.records.clinical_trials.len(), 1);
    assert!(response.is_partial());
    assert!(response.metadata.errors.iter().any(|e| e.source == "pubchem"));
}
