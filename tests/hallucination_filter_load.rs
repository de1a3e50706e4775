use std::fs;

use tempfile::tempdir;
use transcript_platform::filter::HallucinationFilter;

#[test]
fn loads_phrases_from_a_single_file() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("phrases.txt");
    fs::write(&file, "Thanks for watching\nBye for now\n").unwrap();

    let filter = HallucinationFilter::load(&[file]).unwrap();
    assert!(filter.is_hallucination("  THANKS FOR WATCHING  "));
    assert!(filter.is_hallucination("bye for now"));
    assert!(!filter.is_hallucination("let's begin the meeting"));
}

#[test]
fn loads_phrases_from_every_file_in_a_directory() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "subscribe now\n").unwrap();
    fs::write(dir.path().join("b.txt"), "see you next time\n").unwrap();

    let filter = HallucinationFilter::load(&[dir.path()]).unwrap();
    assert!(filter.is_hallucination("subscribe now"));
    assert!(filter.is_hallucination("see you next time"));
}

#[test]
fn mixes_file_and_directory_sources() {
    let file_dir = tempdir().unwrap();
    let standalone = file_dir.path().join("standalone.txt");
    fs::write(&standalone, "thank you\n").unwrap();

    let dir_dir = tempdir().unwrap();
    fs::write(dir_dir.path().join("c.txt"), "please subscribe\n").unwrap();

    let filter = HallucinationFilter::load(&[standalone, dir_dir.path().to_path_buf()]).unwrap();
    assert!(filter.is_hallucination("thank you"));
    assert!(filter.is_hallucination("please subscribe"));
}
