mod common;

use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::error::KilnError;
use kiln_common::keg::{InstalledPackageRecord, KegRegistry, RECEIPT_FILENAME};
use kiln_common::model::formula::{Formula, FormulaOption};
use kiln_common::options::{evaluate, BuildConfiguration, OptionRequest, Toolchain};
use kiln_core::install::{install_keg, InstallOutcome, InstallRequest};
use kiln_core::uninstall::uninstall_package;

use common::Fixture;

fn formula(name: &str) -> Formula {
    let mut f = Formula::new(name, "1.8.0", format!("https://x.invalid/{name}.tar.bz2"), "ab");
    f.options.push(FormulaOption {
        name: "java".into(),
        description: "Build Java bindings".into(),
        default: false,
        effects: Default::default(),
    });
    f
}

fn image(fx: &Fixture, label: &str, files: &[&str]) -> PathBuf {
    let dir = fx.root.path().join("images").join(label);
    for rel in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{label}:{rel}")).unwrap();
    }
    dir
}

fn install(
    fx: &Fixture,
    formula: &Formula,
    build_config: &BuildConfiguration,
    image_prefix: &Path,
    overwrite: bool,
) -> Result<InstallOutcome, KilnError> {
    reinstall(fx, formula, build_config, image_prefix, overwrite, None)
}

fn reinstall(
    fx: &Fixture,
    formula: &Formula,
    build_config: &BuildConfiguration,
    image_prefix: &Path,
    overwrite: bool,
    replacing: Option<&InstalledPackageRecord>,
) -> Result<InstallOutcome, KilnError> {
    install_keg(&InstallRequest {
        config: &fx.config,
        formula,
        build_config,
        image_prefix,
        sha256: "ab",
        installed_on_request: true,
        poured_from_bottle: false,
        runtime_dependencies: &[],
        replacing,
        overwrite,
    })
}

fn defaults(formula: &Formula) -> BuildConfiguration {
    evaluate(formula, &OptionRequest::new(), &Toolchain::default()).unwrap()
}

#[test]
fn installing_the_same_configuration_twice_is_a_no_op() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let config = defaults(&svn);
    let img = image(&fx, "svn", &["bin/svn", "share/man/man1/svn.1"]);

    let first = install(&fx, &svn, &config, &img, false).unwrap();
    let InstallOutcome::Installed(record) = &first else {
        panic!("expected a fresh install, got {first:?}");
    };
    let receipt = record.install_path.join(RECEIPT_FILENAME);
    let receipt_before = fs::read(&receipt).unwrap();

    let second = install(&fx, &svn, &config, &img, false).unwrap();
    assert_eq!(second, InstallOutcome::AlreadyInstalled(record.clone()));
    assert_eq!(fs::read(&receipt).unwrap(), receipt_before);
}

#[test]
fn different_options_for_an_installed_version_conflict_unless_overwriting() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let img = image(&fx, "svn", &["bin/svn"]);
    install(&fx, &svn, &defaults(&svn), &img, false).unwrap();

    let java = evaluate(&svn, &OptionRequest::with_options(["java"]), &Toolchain::default()).unwrap();
    let err = install(&fx, &svn, &java, &img, false).unwrap_err();
    assert!(matches!(err, KilnError::InstallConflict { .. }));

    let replaced = install(&fx, &svn, &java, &img, true).unwrap();
    assert_eq!(replaced.record().enabled_options, ["java"]);
    let on_disk = KegRegistry::new(fx.config.clone())
        .get_installed_record("subversion")
        .unwrap()
        .unwrap();
    assert_eq!(on_disk.enabled_options, ["java"]);
}

#[test]
fn link_owned_by_another_package_names_the_owner() {
    let fx = Fixture::new();
    let legacy = formula("svn-legacy");
    install(&fx, &legacy, &defaults(&legacy), &image(&fx, "legacy", &["bin/svn"]), false).unwrap();

    let svn = formula("subversion");
    let img = image(&fx, "svn", &["bin/svn", "bin/svnadmin"]);
    let err = install(&fx, &svn, &defaults(&svn), &img, false).unwrap_err();
    assert!(matches!(
        err,
        KilnError::InstallConflict { ref package, owner: Some(ref owner), .. }
            if package == "subversion" && owner == "svn-legacy"
    ));
    assert!(!fx.config.formula_keg_path("subversion", "1.8.0").exists());
    assert!(!fx.config.bin_dir().join("svnadmin").exists());

    install(&fx, &svn, &defaults(&svn), &img, true).unwrap();
    assert_eq!(
        fs::read_link(fx.config.bin_dir().join("svn")).unwrap(),
        fx.config.formula_keg_path("subversion", "1.8.0").join("bin/svn")
    );
}

#[test]
fn leftover_keg_without_receipt_is_replaced() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let keg = fx.config.formula_keg_path("subversion", "1.8.0");
    fs::create_dir_all(keg.join("bin")).unwrap();
    fs::write(keg.join("bin/stale"), "from an aborted run").unwrap();
    assert!(!KegRegistry::new(fx.config.clone()).is_installed("subversion").unwrap());

    install(&fx, &svn, &defaults(&svn), &image(&fx, "svn", &["bin/svn"]), false).unwrap();
    assert!(!keg.join("bin/stale").exists());
    assert!(keg.join("bin/svn").is_file());
}

#[test]
fn empty_image_is_refused() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let missing = fx.root.path().join("images/nothing");
    assert!(matches!(
        install(&fx, &svn, &defaults(&svn), &missing, false),
        Err(KilnError::ValidationError(_))
    ));
}

#[test]
fn uninstall_removes_links_opt_and_keg() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let img = image(&fx, "svn", &["bin/svn", "lib/libsvn_client-1.a", "libexec/private"]);
    install(&fx, &svn, &defaults(&svn), &img, false).unwrap();
    assert!(fx.config.bin_dir().join("svn").is_symlink());

    let record = uninstall_package(&fx.config, "subversion").unwrap();
    assert_eq!(record.version, "1.8.0");
    assert!(!fx.config.bin_dir().join("svn").exists());
    assert!(!fx.config.kiln_root().join("lib/libsvn_client-1.a").exists());
    assert!(!fx.config.formula_opt_path("subversion").exists());
    assert!(!fx.config.formula_cellar_dir("subversion").exists());

    assert!(matches!(
        uninstall_package(&fx.config, "subversion"),
        Err(KilnError::NotFound(_))
    ));
}

#[test]
fn reinstall_refused_by_a_link_conflict_leaves_the_old_keg_in_place() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let old = install(&fx, &svn, &defaults(&svn), &image(&fx, "old", &["bin/svn"]), false).unwrap();
    let old = old.record().clone();

    let foreign = fx.config.bin_dir().join("extra");
    fs::write(&foreign, "not ours").unwrap();

    let java = evaluate(&svn, &OptionRequest::with_options(["java"]), &Toolchain::default()).unwrap();
    let img = image(&fx, "new", &["bin/svn", "bin/extra"]);
    let err = reinstall(&fx, &svn, &java, &img, false, Some(&old)).unwrap_err();
    assert!(
        matches!(&err, KilnError::InstallConflict { owner: None, path, .. } if *path == foreign),
        "{err:?}"
    );

    let registry = KegRegistry::new(fx.config.clone());
    let record = registry.get_installed_record("subversion").unwrap().unwrap();
    assert_eq!(record, old);
    let svn_link = fx.config.bin_dir().join("svn");
    assert_eq!(fs::read_link(&svn_link).unwrap(), old.install_path.join("bin/svn"));
    assert_eq!(fs::read_to_string(&svn_link).unwrap(), "old:bin/svn");
    assert_eq!(fs::read_to_string(&foreign).unwrap(), "not ours");
}

#[test]
fn reinstall_of_the_same_version_swaps_content_and_drops_stale_links() {
    let fx = Fixture::new();
    let svn = formula("subversion");
    let old_img = image(&fx, "old", &["bin/svn", "bin/svnold"]);
    let old = install(&fx, &svn, &defaults(&svn), &old_img, false).unwrap();
    let old = old.record().clone();

    let java = evaluate(&svn, &OptionRequest::with_options(["java"]), &Toolchain::default()).unwrap();
    let img = image(&fx, "new", &["bin/svn", "lib/libsvnjavahl.so"]);
    let outcome = reinstall(&fx, &svn, &java, &img, false, Some(&old)).unwrap();
    let InstallOutcome::Installed(record) = outcome else {
        panic!("expected the keg to be replaced, got {outcome:?}");
    };
    assert_eq!(record.install_path, old.install_path);
    assert_eq!(record.enabled_options, ["java"]);

    let bin = fx.config.bin_dir();
    assert_eq!(fs::read_to_string(bin.join("svn")).unwrap(), "new:bin/svn");
    assert!(fs::symlink_metadata(bin.join("svnold")).is_err());
    assert!(fx.config.kiln_root().join("lib/libsvnjavahl.so").exists());

    let leftovers: Vec<String> = fs::read_dir(fx.config.formula_cellar_dir("subversion"))
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, ["1.8.0"]);
}
