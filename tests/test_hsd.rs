use dftbstep::hsd::{deep_merge, emit, to_hsd, ConfigTree, ConfigValue, Scalar};

fn tree(json: &str) -> ConfigTree {
    serde_json::from_str(json).unwrap()
}

#[test]
fn test_emit_dftb_input() {
    let input = tree(
        r#"{
            "Options": {"WriteResultsTag": true},
            "Hamiltonian": {
                "DFTB": {
                    "SCC": true,
                    "SCCTolerance": 1e-5,
                    "MaxSCCIterations": 100,
                    "Filling = Fermi": {"Temperature [K]": 300.0}
                }
            }
        }"#,
    );
    let expected = "\
Options {
    WriteResultsTag = Yes
}
Hamiltonian {
    DFTB {
        SCC = Yes
        SCCTolerance = 1e-5
        MaxSCCIterations = 100
        Filling = Fermi {
            Temperature [K] = 300.0
        }
    }
}
";
    assert_eq!(emit(&input), expected);
}

#[test]
fn test_indent_width() {
    let input = tree(r#"{"Analysis": {"PrintForces": false}}"#);
    assert_eq!(to_hsd(&input, 2), "Analysis {\n  PrintForces = No\n}\n");
}

#[test]
fn test_empty_block() {
    let input = tree(r#"{"Hamiltonian": {"DFTB": {"SpinPolarisation": {}}}}"#);
    assert!(emit(&input).contains("        SpinPolarisation {\n        }\n"));
}

#[test]
fn test_merge_adds_and_overwrites() {
    let mut shared = tree(
        r#"{"Options": {"WriteResultsTag": true},
            "Hamiltonian": {"DFTB": {"SlaterKosterFiles": {"H-H": "\"H-H.skf\""}}}}"#,
    );
    let step = tree(
        r#"{"Hamiltonian": {"DFTB": {"SCC": true}},
            "Options": {"WriteResultsTag": false, "ReadChargesAsText": true}}"#,
    );
    deep_merge(&mut shared, &step);

    let dftb = shared.get_tree("Hamiltonian").and_then(|h| h.get_tree("DFTB")).unwrap();
    assert!(dftb.contains_key("SlaterKosterFiles"));
    assert_eq!(dftb.get("SCC"), Some(&ConfigValue::Scalar(Scalar::Bool(true))));

    let options = shared.get_tree("Options").unwrap();
    assert_eq!(
        options.get("WriteResultsTag"),
        Some(&ConfigValue::Scalar(Scalar::Bool(false)))
    );
    assert_eq!(options.keys().collect::<Vec<_>>(), vec!["WriteResultsTag", "ReadChargesAsText"]);
    assert_eq!(shared.keys().collect::<Vec<_>>(), vec!["Options", "Hamiltonian"]);
}

#[test]
fn test_merge_replaces_scalar_with_tree() {
    let mut destination = tree(r#"{"HCorrection": "None {}"}"#);
    let source = tree(r#"{"HCorrection": {"Damping": {"Exponent": 4.0}}}"#);
    deep_merge(&mut destination, &source);
    assert_eq!(destination, source);
}

#[test]
fn test_merge_is_idempotent() {
    let base = tree(r#"{"A": {"B": 1, "C": {"D": "x"}}, "E": true}"#);
    let update = tree(r#"{"A": {"C": {"D": "y", "F": 2.5}}, "G": {}}"#);

    let mut once = base.clone();
    deep_merge(&mut once, &update);
    let mut twice = once.clone();
    deep_merge(&mut twice, &update);
    assert_eq!(once, twice);
    assert_eq!(
        once.get_path(&["A", "C", "D"]),
        Some(&ConfigValue::Scalar(Scalar::Text("y".to_string())))
    );
    assert_eq!(once.get_path(&["A", "B"]), Some(&ConfigValue::Scalar(Scalar::Int(1))));
}

#[test]
fn test_merge_into_empty_copies_source() {
    let source = tree(r#"{"Driver = GeometryOptimization": {"MaxSteps": 200, "Convergence": {"GradAMax": 1e-4}}}"#);
    let mut destination = ConfigTree::new();
    deep_merge(&mut destination, &source);
    assert_eq!(destination, source);
}

#[test]
fn test_json_round_trip_keeps_order() {
    let input = tree(r#"{"Zeta": 1, "Alpha": {"Mid": "m", "First": 2.0}}"#);
    let json = serde_json::to_string(&input).unwrap();
    assert_eq!(json, r#"{"Zeta":1,"Alpha":{"Mid":"m","First":2.0}}"#);
    assert_eq!(tree(&json), input);
}
