//! Parser integration through the compiler's entry points.

use candorc::CompileOptions;

fn parse(src: &str) -> candor_ast::Module {
    let _guard = candorc::diagnostics::suppress();
    candorc::parse(src, &CompileOptions::default()).expect("source parses")
}

#[test]
fn statements_are_newline_separated() {
    let module = parse("a = 1\nb = 2\nreturn a + b");
    assert_eq!(module.body.len(), 3);
}

#[test]
fn continuation_lines_fold() {
    let module = parse("a = 1 +\n    2\nreturn a");
    assert_eq!(module.body.len(), 2);
}

#[test]
fn nested_function_bodies_span_lines() {
    let module = parse("f(x) {\n  y = x + 1\n  return y\n}\nreturn f(1)");
    assert_eq!(module.body.len(), 2);
    match &module.body[0] {
        candor_ast::Stmt::Expr(candor_ast::Expr::Function { body, .. }) => {
            assert_eq!(body.len(), 2);
        }
        other => panic!("expected function declaration, got {:?}", other),
    }
}

#[test]
fn binary_operators_are_right_associative() {
    let module = parse("return 1 - 2 - 3");
    match &module.body[0] {
        candor_ast::Stmt::Return(candor_ast::ReturnStmt {
            value: Some(candor_ast::Expr::Binary { lhs, rhs, .. }),
            ..
        }) => {
            assert!(matches!(lhs.as_ref(), candor_ast::Expr::Number { .. }));
            assert!(matches!(rhs.as_ref(), candor_ast::Expr::Binary { .. }));
        }
        other => panic!("expected binary return, got {:?}", other),
    }
}

#[test]
fn parse_errors_are_reported() {
    let _guard = candorc::diagnostics::suppress();
    let err = candorc::parse("a = = 1", &CompileOptions::default()).unwrap_err();
    let err = err.downcast::<candorc::CompileError>().unwrap();
    assert!(matches!(err, candorc::CompileError::Parse { .. }));
}
