use approx::assert_relative_eq;
use dftbstep::metadata::PropertyTable;
use dftbstep::reshape::{reshape, NdArray, ShapeError};
use dftbstep::results::{parse, parse_records, ResultValue, ResultsError};

const RESULTS_TAG: &str = "\
mermin_energy       :real:0:
 -0.407802446281283E+001
total_energy        :real:0:
 -0.407802446281283E+001
forces              :real:2:3,3
  0.000000000000000E+000  0.000000000000000E+000 -0.102553391312127E-001
  0.000000000000000E+000  0.486212478468047E-002  0.512766956560635E-002
  0.000000000000000E+000 -0.486212478468047E-002  0.512766956560635E-002
fermi_level         :real:1:2
 -0.244016063218744E+000 -0.244016063218744E+000
gross_atomic_charges:real:1:3
  0.592683380429604E+000 -0.296341690214802E+000 -0.296341690214802E+000
";

fn standard() -> &'static PropertyTable {
    PropertyTable::standard()
}

#[test]
fn test_parse_water_results() {
    let results = parse(RESULTS_TAG, standard()).unwrap();

    assert_relative_eq!(results.get_real("total_energy").unwrap(), -4.07802446281283, epsilon = 1e-12);
    assert_eq!(results.get_real("energy"), results.get_real("total_energy"));
    assert_eq!(results.units("energy"), Some("E_h"));

    let forces = results.get_real_array("forces").unwrap();
    assert_eq!(forces.shape(), vec![3, 3]);
    let gradients = results.get_real_array("gradients").unwrap();
    for (f, g) in forces.flatten().into_iter().zip(gradients.flatten()) {
        assert_eq!(*g, -*f);
    }
    assert_eq!(results.units("gradients"), Some("E_h/bohr"));

    let charges = results.get_real_array("gross_atomic_charges").unwrap();
    assert_eq!(charges.shape(), vec![3]);
}

#[test]
fn test_two_equal_fermi_levels_collapse() {
    let results = parse(RESULTS_TAG, standard()).unwrap();
    assert_relative_eq!(results.get_real("fermi_level").unwrap(), -0.244016063218744, epsilon = 1e-15);
    assert_eq!(results.get("spin polarized"), Some(&ResultValue::Flag(true)));
}

#[test]
fn test_single_fermi_level() {
    let results = parse("fermi_level:real:1:1\n -0.25\n", standard()).unwrap();
    assert_eq!(results.get_real("fermi_level"), Some(-0.25));
    assert_eq!(results.get("spin polarized"), Some(&ResultValue::Flag(false)));
}

#[test]
fn test_different_fermi_levels_are_not_supported() {
    let result = parse("fermi_level:real:1:2\n -0.25 -0.20\n", standard());
    assert!(matches!(result, Err(ResultsError::NotImplemented(_))));
}

#[test]
fn test_comments_and_blank_lines_are_skipped() {
    let text = "# written by DFTB+\n\ntotal_energy:real:0:\n 1.5\n";
    let results = parse(text, standard()).unwrap();
    assert_eq!(results.get_real("total_energy"), Some(1.5));
}

#[test]
fn test_records_keep_declared_dimensions() {
    let records = parse_records("eigenvalues:real:3:2,1,1\n -0.5 0.2\n").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "eigenvalues");
    assert_eq!(records[0].dimensions, vec![2, 1, 1]);
}

#[test]
fn test_malformed_header_reports_line() {
    match parse("total_energy:real:0:\n 1.0\nnot a header\n", standard()) {
        Err(ResultsError::Parse { line, .. }) => assert_eq!(line, 3),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_unknown_property_is_kept() {
    let results = parse("my_property:real:0:\n 2.0\n", standard()).unwrap();
    assert_eq!(results.get_real("my_property"), Some(2.0));
    assert_eq!(results.units("my_property"), None);
}

#[test]
fn test_reshape_last_index_fastest() {
    let nested = reshape((0..6).collect::<Vec<i32>>(), &[2, 3]).unwrap();
    assert_eq!(nested.get(1).unwrap().flatten(), vec![&3, &4, &5]);
    assert_eq!(nested.into_flat(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_reshape_scalar() {
    assert_eq!(reshape(vec![7.0], &[]).unwrap(), NdArray::Scalar(7.0));
}

#[test]
fn test_reshape_errors() {
    assert_eq!(
        reshape(vec![1, 2, 3], &[2, 2]),
        Err(ShapeError::ShapeMismatch {
            received: 3,
            expected: 4,
            dims: vec![2, 2],
        })
    );
    assert_eq!(
        reshape(Vec::<i32>::new(), &[0, 3]),
        Err(ShapeError::ZeroDimension { dims: vec![0, 3] })
    );
}

#[test]
fn test_header_without_ndims_field() {
    let results = parse("forces:real:2,3\n1.0 2.0 3.0\n4.0 5.0 6.0\n", standard()).unwrap();

    let forces = results.get_real_array("forces").unwrap();
    let expected = reshape(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    assert_eq!(forces, &expected);
    assert_eq!(forces.get(1).unwrap().flatten(), vec![&4.0, &5.0, &6.0]);

    let gradients = results.get_real_array("gradients").unwrap();
    assert_eq!(gradients, &expected.map(|v| -v));
}

#[test]
fn test_ndims_disagreeing_with_dimensions() {
    match parse("forces:real:3:2,3\n1.0 2.0 3.0\n4.0 5.0 6.0\n", standard()) {
        Err(ResultsError::Parse { line, text }) => {
            assert_eq!(line, 1);
            assert_eq!(text, "forces:real:3:2,3");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_oversized_header_reads_only_available_values() {
    let records = parse_records("x:real:1:100000000000000\n1.0\n").unwrap();
    assert!(records.is_empty());
}

#[test]
fn test_overflowing_dimensions_are_a_parse_error() {
    match parse_records("x:real:3:4294967296,4294967296,2\n1.0\n") {
        Err(ResultsError::Parse { line, .. }) => assert_eq!(line, 1),
        other => panic!("unexpected result {:?}", other),
    }
}
