//! Integration tests for composing components in a pipeline.

use std::collections::HashMap;

use seqpipe::{
    Annotatable, Boundary, Document, Example, Pipe, Pipeline, Scorable, SentenceRecognizer,
    Sentencizer, Tagger, Trainable,
};

fn trained_tagger() -> Tagger {
    let mut tagger = Tagger::new("tagger");
    let examples = vec![
        Example::new(Document::from_words(&["dogs", "bark", "."])).with_tags(vec![
            Some("NOUN".into()),
            Some("VERB".into()),
            Some("PUNCT".into()),
        ]),
        Example::new(Document::from_words(&["cats", "sleep", "."])).with_tags(vec![
            Some("NOUN".into()),
            Some("VERB".into()),
            Some("PUNCT".into()),
        ]),
    ];
    let mut sgd = tagger.begin_training(&examples, None).unwrap();
    let mut losses = HashMap::new();
    for _ in 0..30 {
        tagger
            .update(&examples, 0.0, Some(sgd.as_mut()), &mut losses)
            .unwrap();
    }
    tagger
}

fn trained_senter() -> SentenceRecognizer {
    let mut senter = SentenceRecognizer::new("senter");
    let examples = vec![Example::new(Document::from_words(&[
        "Hi", "there", ".", "Bye", "now", ".",
    ]))
    .with_sent_starts(vec![
        Some(true),
        Some(false),
        Some(false),
        Some(true),
        Some(false),
        Some(false),
    ])];
    let mut sgd = senter.begin_training(&examples, None).unwrap();
    let mut losses = HashMap::new();
    for _ in 0..30 {
        senter
            .update(&examples, 0.0, Some(sgd.as_mut()), &mut losses)
            .unwrap();
    }
    senter
}

#[test]
fn test_pipeline_runs_components_in_order() {
    let mut pipeline = Pipeline::new(8);
    pipeline.add(Box::new(Sentencizer::with_punct_chars(
        "sentencizer",
        ['.', '!', '?'].into_iter().collect(),
    )));
    pipeline.add(Box::new(trained_tagger()));
    assert_eq!(pipeline.component_names(), vec!["sentencizer", "tagger"]);

    let mut docs = vec![
        Document::from_words(&["dogs", "bark", ".", "cats", "sleep", "."]),
        Document::from_words(&["cats", "sleep", "."]),
    ];
    pipeline.process(&mut docs).unwrap();

    // Every token got a boundary decision and a tag.
    for doc in &docs {
        for token in &doc.tokens {
            assert_ne!(token.sent_start, Boundary::Unset);
            assert!(token.tag.is_some());
        }
    }
    assert_eq!(docs[0].sentences(), vec![0..3, 3..6]);
}

#[test]
fn test_rule_based_boundaries_win_over_statistical() {
    // Sentencizer first: its decisions stick, the recognizer only fills
    // what remains undecided.
    let sentencizer =
        Sentencizer::with_punct_chars("sentencizer", ['.', '!', '?'].into_iter().collect());
    let senter = trained_senter();

    let mut docs = vec![Document::from_words(&["Hi", "there", ".", "Bye", "now", "."])];
    sentencizer.apply(&mut docs).unwrap();
    let decided: Vec<Boundary> = docs[0].tokens.iter().map(|t| t.sent_start).collect();

    senter.apply(&mut docs).unwrap();
    let after: Vec<Boundary> = docs[0].tokens.iter().map(|t| t.sent_start).collect();
    assert_eq!(decided, after);
}

#[test]
fn test_tagger_annotations_survive_second_pass() {
    let tagger = trained_tagger();
    let mut docs = vec![Document::from_words(&["dogs", "bark", "."])];
    tagger.apply(&mut docs).unwrap();
    let tagged = docs[0].clone();

    // A second application must not change anything: all slots are filled.
    tagger.apply(&mut docs).unwrap();
    assert_eq!(
        serde_json::to_string(&tagged).unwrap(),
        serde_json::to_string(&docs[0]).unwrap()
    );
}

#[test]
fn test_pipeline_handles_empty_documents() {
    let mut pipeline = Pipeline::new(2);
    pipeline.add(Box::new(Sentencizer::new("sentencizer")));
    pipeline.add(Box::new(trained_tagger()));

    let mut docs = vec![
        Document::default(),
        Document::from_words(&["dogs"]),
        Document::default(),
    ];
    pipeline.process(&mut docs).unwrap();
    assert!(docs[0].tokens.is_empty());
    assert!(docs[1].tokens[0].tag.is_some());
}

#[test]
fn test_sentencizer_two_sentences() {
    let sentencizer =
        Sentencizer::with_punct_chars("sentencizer", ['.', '!', '?'].into_iter().collect());
    let docs = [Document::from_words(&["Hi", "there", ".", "Bye", "now", "."])];
    let starts = sentencizer.predict(&docs).unwrap();
    let start_positions: Vec<usize> = starts[0]
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| s.then_some(i))
        .collect();
    assert_eq!(start_positions, vec![0, 3]);
}
