//! Property-based invariant tests for the path tokenizer.
//!
//! 1. Arbitrary input never panics; failures carry an in-range offset.
//! 2. The display form of a parsed path parses back to the same tokens.
//! 3. Quoted keys survive any content, including quotes and backslashes.
//! 4. `len` counts the top-level key plus every segment.

use ftui_state::{ParsedPath, Token, parse_path};
use proptest::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────────

fn ident() -> impl Strategy<Value = String> {
    "[A-Za-z_$][A-Za-z0-9_$-]{0,8}"
}

fn token() -> impl Strategy<Value = Token> {
    prop_oneof![
        ident().prop_map(Token::Prop),
        (0usize..10_000).prop_map(Token::Index),
        ".{0,12}".prop_map(Token::Key),
    ]
}

fn parsed_path() -> impl Strategy<Value = ParsedPath> {
    (ident(), proptest::collection::vec(token(), 0..6))
        .prop_map(|(top, rest)| ParsedPath { top, rest })
}

// ═════════════════════════════════════════════════════════════════════════
// 1. No panics
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn arbitrary_input_never_panics(input in ".{0,40}") {
        if let Err(err) = parse_path(&input) {
            prop_assert!(err.offset <= input.len());
            prop_assert_eq!(err.path, input);
        }
    }

    #[test]
    fn bracket_soup_never_panics(input in "[a-z.\\[\\]\"'\\\\0-9]{0,24}") {
        let _ = parse_path(&input);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2-4. Canonical form
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn display_form_reparses(path in parsed_path()) {
        let text = path.to_string();
        let reparsed = parse_path(&text).unwrap();
        prop_assert_eq!(&reparsed, &path);
        prop_assert_eq!(reparsed.len(), path.rest.len() + 1);
        prop_assert_eq!(reparsed.is_simple(), path.rest.is_empty());
    }

    #[test]
    fn single_quotes_are_equivalent(key in "[^'\\\\]{0,12}") {
        let single = parse_path(&format!("m['{key}']")).unwrap();
        prop_assert_eq!(single.rest, vec![Token::Key(key)]);
    }
}

#[test]
fn escaped_quotes_inside_keys() {
    let parsed = parse_path(r#"m["a\"b"]['c\'d'][2].e"#).unwrap();
    assert_eq!(parsed.top, "m");
    assert_eq!(
        parsed.rest,
        vec![
            Token::Key("a\"b".into()),
            Token::Key("c'd".into()),
            Token::Index(2),
            Token::Prop("e".into()),
        ]
    );
}
