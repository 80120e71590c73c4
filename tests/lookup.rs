//! Resolve single coordinates from the command line.

use cli_test_dir::*;

const GERMANY: &str = include_str!("fixtures/DE.txt");
const FRANCE: &str = include_str!("fixtures/FR.txt");

/// Set up a test directory containing our German and French gazetteers.
fn gazetteer_dir(test_name: &str) -> TestDir {
    let testdir = TestDir::new("reverse-geocoder", test_name);
    testdir.create_file("DE.txt", GERMANY);
    testdir.create_file("FR.txt", FRANCE);
    testdir
}

#[test]
fn lookup_berlin() {
    let testdir = gazetteer_dir("lookup_berlin");
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("lookup")
        .arg("--lat=52.5200")
        .arg("--lon=13.4050")
        .output()
        .expect_success();
    assert_eq!(output.stdout_str().trim(), "Berlin, DE");
}

#[test]
fn lookup_paris_with_country_override() {
    let testdir = gazetteer_dir("lookup_paris_with_country_override");
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("lookup")
        .arg("--lat=48.8566")
        .arg("--lon=2.3522")
        .arg("--country=FR")
        .output()
        .expect_success();
    assert!(output.stdout_str().contains("Paris"));
}

#[test]
fn lookup_far_away_is_unknown() {
    let testdir = gazetteer_dir("lookup_far_away_is_unknown");
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE,FR")
        .arg("--max-radius-km=25")
        .arg("lookup")
        .arg("--lat")
        .arg("-33.9")
        .arg("--lon")
        .arg("18.4")
        .output()
        .expect_success();
    assert_eq!(output.stdout_str().trim(), "Unknown");
}

#[test]
fn lookup_accepts_its_own_radius() {
    let testdir = gazetteer_dir("lookup_accepts_its_own_radius");
    // Potsdam and Berlin are both tens of kilometers away from here.
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("lookup")
        .arg("--lat=52.0")
        .arg("--lon=13.0")
        .arg("--max-radius-km=1")
        .output()
        .expect_success();
    assert_eq!(output.stdout_str().trim(), "Unknown");

    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("lookup")
        .arg("--lat=52.0")
        .arg("--lon=13.0")
        .arg("--max-radius-km=500")
        .output()
        .expect_success();
    assert_eq!(output.stdout_str().trim(), "Potsdam, DE");
}

#[test]
fn lookup_respects_loader_policy() {
    let testdir = gazetteer_dir("lookup_respects_loader_policy");
    // Munich is an administrative seat, but if we only keep capitals, the
    // nearest place is Berlin, and that's too far away.
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("--feature-codes=PPLC")
        .arg("lookup")
        .arg("--lat=48.137")
        .arg("--lon=11.575")
        .output()
        .expect_success();
    assert_eq!(output.stdout_str().trim(), "Unknown");
}

#[test]
fn lookup_without_data_fails() {
    let testdir = TestDir::new("reverse-geocoder", "lookup_without_data_fails");
    let output = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE")
        .arg("lookup")
        .arg("--lat=52.52")
        .arg("--lon=13.405")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("DE"));
}
