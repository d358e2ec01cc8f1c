use super::{group_spans_separator, realize, OutputError, OutputSpec};
use std::{
    fs,
    path::{Path, PathBuf},
};

fn spec(value: &str) -> OutputSpec {
    value.parse().unwrap()
}

#[test]
pub fn declare_normalizes_relative_to_pwd() {
    let root = tempfile::tempdir().unwrap();
    let declared =
        OutputSpec::declare("../results/./a.txt", Path::new("jobs/one"), root.path(), false)
            .unwrap();

    assert_eq!(declared, OutputSpec::Literal(PathBuf::from("jobs/results/a.txt")));
}

#[test]
pub fn declare_detects_directories() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("data/raw")).unwrap();

    assert_eq!(
        OutputSpec::declare("data/raw", Path::new(""), root.path(), false).unwrap(),
        OutputSpec::Directory(PathBuf::from("data/raw"))
    );
    assert_eq!(
        OutputSpec::declare("fresh/", Path::new(""), root.path(), false).unwrap(),
        OutputSpec::Directory(PathBuf::from("fresh"))
    );
    assert_eq!(
        OutputSpec::declare(".", Path::new(""), root.path(), false).unwrap(),
        OutputSpec::Directory(PathBuf::new())
    );
}

#[test]
pub fn declare_rejects_escaping_and_wildcards() {
    let root = tempfile::tempdir().unwrap();

    assert!(matches!(
        OutputSpec::declare("../../x", Path::new("a"), root.path(), false),
        Err(OutputError::OutsideRepository(_))
    ));
    assert!(matches!(
        OutputSpec::declare("/etc/passwd", Path::new(""), root.path(), false),
        Err(OutputError::OutsideRepository(_))
    ));
    assert!(matches!(
        OutputSpec::declare("out/*.txt", Path::new(""), root.path(), false),
        Err(OutputError::WildcardNotAllowed(_))
    ));

    let absolute = root.path().join("inside.txt");
    assert_eq!(
        OutputSpec::declare(absolute.to_str().unwrap(), Path::new("x"), root.path(), false)
            .unwrap(),
        OutputSpec::Literal(PathBuf::from("inside.txt"))
    );
}

#[test]
pub fn wildcard_root_is_literal_prefix() {
    let root = tempfile::tempdir().unwrap();
    let declared =
        OutputSpec::declare("out/run_*/log.txt", Path::new("exp"), root.path(), true).unwrap();

    assert_eq!(declared.root(), Path::new("exp/out"));
    assert_eq!(declared.to_string(), "exp/out/run_*/log.txt");
}

#[test]
pub fn canonical_form_survives_display() {
    for value in ["a/b.txt", "a/b/", "./", "a/*/c.txt"] {
        assert_eq!(spec(value).to_string(), value);
    }
}

#[test]
pub fn literal_and_directory_overlap() {
    assert!(spec("dir/").overlaps(&spec("dir/sub/file.txt")));
    assert!(spec("dir/sub/file.txt").overlaps(&spec("dir/")));
    assert!(spec("a.txt").overlaps(&spec("a.txt")));
    assert!(spec("./").overlaps(&spec("anything/at/all")));
    // literals may turn out to be directories
    assert!(spec("dir").overlaps(&spec("dir/x")));

    assert!(!spec("dir/").overlaps(&spec("dir2/file")));
    assert!(!spec("a/x.txt").overlaps(&spec("a/y.txt")));
    assert!(!spec("jobs/1/").overlaps(&spec("jobs/2/")));
}

#[test]
pub fn wildcard_against_paths() {
    assert!(spec("out/*.txt").overlaps(&spec("out/a.txt")));
    assert!(spec("out/*.txt").overlaps(&spec("out/")));
    assert!(spec("out/*.txt").overlaps(&spec("./")));
    // a matching path is a directory containing the literal
    assert!(spec("out/run_*").overlaps(&spec("out/run_3/result.csv")));
    // the literal may be a directory holding matches
    assert!(spec("out/*/x.txt").overlaps(&spec("out/a")));

    assert!(!spec("out/*.txt").overlaps(&spec("out/a.csv")));
    assert!(!spec("out/*.txt").overlaps(&spec("other/a.txt")));
    assert!(!spec("out/run_?/x").overlaps(&spec("out/run_10/x")));
}

#[test]
pub fn alternations_across_separators_never_miss() {
    // `{a,b/c}` can expand into more components than the pattern shows
    assert!(spec("out/{a,b/c}.txt").overlaps(&spec("out/b/c.txt")));
    assert!(spec("out/b/c.txt").overlaps(&spec("out/{a,b/c}.txt")));
    assert!(spec("out/{x,y/z}/data").overlaps(&spec("out/y/z/data/part.csv")));
    assert!(!spec("out/{a,b/c}.txt").overlaps(&spec("elsewhere/b/c.txt")));

    // groups within a single component are matched component-wise
    assert!(spec("out/{a,b}.txt").overlaps(&spec("out/b.txt")));
    assert!(!spec("out/{a,b}.txt").overlaps(&spec("out/c.txt")));
    assert!(spec("out/[ab]/x.txt").overlaps(&spec("out/b/x.txt")));
    assert!(!spec("out/[ab]/x.txt").overlaps(&spec("out/c/x.txt")));

    assert!(group_spans_separator("out/{a,b/c}.txt"));
    assert!(group_spans_separator("[a/b]"));
    assert!(!group_spans_separator("out/{a,b}/[xy].txt"));
    assert!(!group_spans_separator("out/\\{a,b/c"));
}

#[test]
pub fn wildcard_against_wildcard_is_conservative() {
    assert!(spec("out/*.txt").overlaps(&spec("out/*.csv")));
    assert!(spec("out/*.txt").overlaps(&spec("out/sub/*.csv")));
    assert!(spec("out/**/x").overlaps(&spec("out/deep/y")));

    assert!(!spec("left/*.txt").overlaps(&spec("right/*.txt")));
}

#[test]
pub fn overlap_is_symmetric_and_never_misses() {
    // seeded linear congruential generator, keeps the generated family stable
    let mut seed: u64 = 0x5eed;
    let mut next = move |bound: u64| {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (seed >> 33) % bound
    };

    let names = ["a", "b", "c"];
    let mut paths = Vec::new();
    for _ in 0..60 {
        let depth = 1 + next(3) as usize;
        let mut path = Vec::new();
        for _ in 0..depth {
            path.push(names[next(names.len() as u64) as usize]);
        }
        paths.push(path.join("/"));
    }

    for left in paths.iter() {
        for right in paths.iter() {
            let left_path = Path::new(left);
            let right_path = Path::new(right);
            let truly_overlapping =
                left_path.starts_with(right_path) || right_path.starts_with(left_path);

            for (left_spec, right_spec) in [
                (spec(left), spec(right)),
                (spec(&format!("{left}/")), spec(right)),
                (spec(left), spec(&format!("{right}/"))),
            ] {
                assert_eq!(left_spec.overlaps(&right_spec), right_spec.overlaps(&left_spec));
                assert_eq!(left_spec.overlaps(&right_spec), truly_overlapping, "{left} vs {right}");
            }

            // a wildcard covering `left` must be reported against everything `left` meets
            let wildcard = spec(&format!("{left}/*"));
            if truly_overlapping {
                assert!(wildcard.overlaps(&spec(right)), "{wildcard} vs {right}");
            }
        }
    }
}

#[test]
pub fn realize_expands_directories_and_wildcards() {
    let root = tempfile::tempdir().unwrap();
    let base = root.path();
    fs::create_dir_all(base.join("out/run_1")).unwrap();
    fs::create_dir_all(base.join("out/run_2")).unwrap();
    fs::create_dir_all(base.join("logs")).unwrap();
    fs::write(base.join("out/run_1/a.txt"), "1").unwrap();
    fs::write(base.join("out/run_2/b.txt"), "2").unwrap();
    fs::write(base.join("out/skip.csv"), "3").unwrap();
    fs::write(base.join("logs/job.log"), "4").unwrap();
    fs::write(base.join("single.txt"), "5").unwrap();

    let realized = realize(
        &[
            spec("out/run_*"),
            spec("logs/"),
            spec("single.txt"),
            spec("missing.txt"),
            spec("logs/job.log"),
        ],
        base,
    )
    .unwrap();

    assert_eq!(
        realized,
        vec![
            PathBuf::from("logs/job.log"),
            PathBuf::from("out/run_1/a.txt"),
            PathBuf::from("out/run_2/b.txt"),
            PathBuf::from("single.txt"),
        ]
    );
}
