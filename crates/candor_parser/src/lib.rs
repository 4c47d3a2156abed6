//! Candor Parser
//!
//! This crate implements a parser for the Candor language using
//! chumsky over a hand-written token stream. It takes a string input
//! and produces a `candor_ast::Module`.
//!
//! Candor statements are newline-terminated; the tokenizer folds
//! continuation newlines (after operators, commas, and opening
//! delimiters) so the parser only ever sees separators that matter.

pub mod tokenizer;

use candor_ast::*;
use chumsky::prelude::*;
use chumsky::select;
use chumsky::Stream;

pub use tokenizer::Token;

type Err = Simple<Token>;

/// Parse a string into a Candor AST Module.
pub fn parse_module(input: &str) -> Result<Module, Vec<Err>> {
    let tokens = tokenizer::tokenize(input);
    let eoi = input.len()..input.len();
    let stream = Stream::from_iter(eoi, tokens.into_iter());
    module_parser().parse(stream)
}

/// Zero or more newline tokens.
fn nl() -> impl Parser<Token, (), Error = Err> + Clone {
    just(Token::Newline).ignored().repeated().ignored()
}

/// One or more newline tokens — the statement separator.
fn stmt_sep() -> impl Parser<Token, (), Error = Err> + Clone {
    just(Token::Newline).ignored().repeated().at_least(1).ignored()
}

fn ident() -> impl Parser<Token, (String, Span), Error = Err> + Clone {
    select! { Token::Name(s) => s }.map_with_span(|s, span| (s, span))
}

/// Parser for the top-level module.
fn module_parser() -> impl Parser<Token, Module, Error = Err> {
    stmt_parser()
        .separated_by(stmt_sep())
        .allow_leading()
        .allow_trailing()
        .then_ignore(end())
        .map_with_span(|body, span| Module { body, span })
}

/// Parser for statements (and, transitively, expressions).
fn stmt_parser() -> impl Parser<Token, Stmt, Error = Err> + Clone {
    recursive(|stmt| {
        let block = stmt
            .clone()
            .separated_by(stmt_sep())
            .allow_leading()
            .allow_trailing()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));

        let expr = expr_parser(block.clone());

        let paren_cond = just(Token::LParen)
            .ignore_then(nl())
            .ignore_then(expr.clone())
            .then_ignore(nl())
            .then_ignore(just(Token::RParen));

        let if_stmt = recursive(|if_stmt| {
            just(Token::If)
                .ignore_then(paren_cond.clone())
                .then(block.clone())
                .then(
                    just(Token::Else)
                        .ignore_then(block.clone().or(if_stmt.map(|s: Stmt| vec![s])))
                        .or_not(),
                )
                .map_with_span(|((cond, then_body), else_body), span| {
                    Stmt::If(IfStmt {
                        cond,
                        then_body,
                        else_body,
                        span,
                    })
                })
        });

        let while_stmt = just(Token::While)
            .ignore_then(paren_cond)
            .then(block.clone())
            .map_with_span(|(cond, body), span| Stmt::While(WhileStmt { cond, body, span }));

        let return_stmt = just(Token::Return)
            .ignore_then(expr.clone().or_not())
            .map_with_span(|value, span| Stmt::Return(ReturnStmt { value, span }));

        let break_stmt = just(Token::Break).map_with_span(|_, span| Stmt::Break(span));
        let continue_stmt = just(Token::Continue).map_with_span(|_, span| Stmt::Continue(span));

        choice((
            if_stmt,
            while_stmt,
            return_stmt,
            break_stmt,
            continue_stmt,
            expr.map(Stmt::Expr),
        ))
    })
}

/// Parser for expressions, parameterized over the function-body block
/// parser so function literals can host statements.
fn expr_parser(
    block: impl Parser<Token, Vec<Stmt>, Error = Err> + Clone + 'static,
) -> impl Parser<Token, Expr, Error = Err> + Clone {
    recursive(move |expr| {
        let comma = nl().then_ignore(just(Token::Comma)).then_ignore(nl());

        // Function parameter: `a` or `b...`
        let param = ident()
            .then(just(Token::Ellipsis).or_not())
            .map(|((name, span), va)| Param {
                name,
                vararg: va.is_some(),
                span,
            });

        let params = param
            .separated_by(comma.clone())
            .delimited_by(
                just(Token::LParen).then_ignore(nl()),
                nl().then_ignore(just(Token::RParen)),
            );

        // `name(params) { body }` and `(params) { body }`
        let named_function = ident()
            .then(params.clone())
            .then(block.clone())
            .map_with_span(|(((name, _), params), body), span| Expr::Function {
                name: Some(name),
                params,
                body,
                span,
            });

        let anon_function = params
            .then(block.clone())
            .map_with_span(|(params, body), span| Expr::Function {
                name: None,
                params,
                body,
                span,
            });

        let number =
            select! { Token::Number(n) => n }.map_with_span(|value, span| Expr::Number { value, span });
        let string =
            select! { Token::Str(s) => s }.map_with_span(|value, span| Expr::Str { value, span });
        let name = ident().map(|(sym, span)| Expr::Ident { sym, span });

        let property_key = choice((
            select! { Token::Name(s) => s }.map_with_span(PropertyKey::Ident),
            select! { Token::Number(n) => n }.map_with_span(PropertyKey::Number),
            select! { Token::Str(s) => s }.map_with_span(PropertyKey::Str),
        ));

        let object_lit = property_key
            .then_ignore(just(Token::Colon).then_ignore(nl()))
            .then(expr.clone())
            .separated_by(comma.clone())
            .allow_trailing()
            .delimited_by(
                just(Token::LBrace).then_ignore(nl()),
                nl().then_ignore(just(Token::RBrace)),
            )
            .map_with_span(|entries, span| Expr::ObjectLit { entries, span });

        let array_lit = expr
            .clone()
            .separated_by(comma.clone())
            .allow_trailing()
            .delimited_by(
                just(Token::LBracket).then_ignore(nl()),
                nl().then_ignore(just(Token::RBracket)),
            )
            .map_with_span(|elements, span| Expr::ArrayLit { elements, span });

        let paren = just(Token::LParen)
            .ignore_then(nl())
            .ignore_then(expr.clone())
            .then_ignore(nl())
            .then_ignore(just(Token::RParen));

        let keyword_unary = choice((
            just(Token::Typeof).to(0u8),
            just(Token::Sizeof).to(1u8),
            just(Token::Keysof).to(2u8),
            just(Token::CloneKw).to(3u8),
            just(Token::Delete).to(4u8),
        ))
        .then(expr.clone())
        .map_with_span(|(kind, inner), span| {
            let inner = Box::new(inner);
            match kind {
                0 => Expr::Typeof { expr: inner, span },
                1 => Expr::Sizeof { expr: inner, span },
                2 => Expr::Keysof { expr: inner, span },
                3 => Expr::Clone { expr: inner, span },
                _ => Expr::Delete { member: inner, span },
            }
        });

        let literal = select! {
            Token::Nil => 0u8,
            Token::True => 1u8,
            Token::False => 2u8,
            Token::Nan => 3u8,
        }
        .map_with_span(|kind, span: Span| match kind {
            0 => Expr::Nil(span),
            1 => Expr::True(span),
            2 => Expr::False(span),
            _ => Expr::Number {
                value: "NaN".to_string(),
                span,
            },
        });

        let primary = choice((
            named_function,
            anon_function,
            keyword_unary,
            literal,
            number,
            string,
            name,
            object_lit,
            array_lit,
            paren,
        ));

        // Postfix operators: member access, indexing, calls, colon
        // calls, post-inc/dec, and argument spread.
        enum Post {
            Dot(String, Span),
            Index(Expr, Span),
            Call(Vec<Expr>, Span),
            ColonCall(String, Vec<Expr>, Span),
            Inc(Span),
            Dec(Span),
            Spread(Span),
        }

        let args = expr
            .clone()
            .then(just(Token::Ellipsis).map_with_span(|_, span: Span| span).or_not())
            .map(|(arg, spread)| match spread {
                Some(span) => {
                    let span = arg.span().start..span.end;
                    Expr::VarArg {
                        expr: Box::new(arg),
                        span,
                    }
                }
                None => arg,
            })
            .separated_by(comma)
            .delimited_by(
                just(Token::LParen).then_ignore(nl()),
                nl().then_ignore(just(Token::RParen)),
            );

        let post = choice((
            just(Token::Dot)
                .ignore_then(ident())
                .map(|(sym, span)| Post::Dot(sym, span)),
            just(Token::LBracket)
                .ignore_then(nl())
                .ignore_then(expr.clone())
                .then_ignore(nl())
                .map_with_span(|idx, span| Post::Index(idx, span))
                .then_ignore(just(Token::RBracket)),
            just(Token::Colon)
                .ignore_then(ident())
                .then(args.clone())
                .map_with_span(|((sym, _), args), span| Post::ColonCall(sym, args, span)),
            args.clone().map_with_span(Post::Call),
            just(Token::Inc).map_with_span(|_, span| Post::Inc(span)),
            just(Token::Dec).map_with_span(|_, span| Post::Dec(span)),
            just(Token::Ellipsis).map_with_span(|_, span| Post::Spread(span)),
        ));

        let postfix = primary.then(post.repeated()).foldl(|obj, post| {
            let start = obj.span().start;
            match post {
                Post::Dot(sym, span) => Expr::Member {
                    obj: Box::new(obj),
                    prop: Box::new(Expr::Str {
                        value: sym,
                        span: span.clone(),
                    }),
                    computed: false,
                    span: start..span.end,
                },
                Post::Index(idx, span) => Expr::Member {
                    obj: Box::new(obj),
                    prop: Box::new(idx),
                    computed: true,
                    span: start..span.end,
                },
                Post::Call(args, span) => Expr::Call {
                    callee: Box::new(obj),
                    args,
                    colon: false,
                    span: start..span.end,
                },
                Post::ColonCall(sym, args, span) => {
                    let prop = Expr::Str {
                        value: sym,
                        span: span.clone(),
                    };
                    Expr::Call {
                        callee: Box::new(Expr::Member {
                            obj: Box::new(obj),
                            prop: Box::new(prop),
                            computed: false,
                            span: start..span.end,
                        }),
                        args,
                        colon: true,
                        span: start..span.end,
                    }
                }
                Post::Inc(span) => Expr::Unary {
                    op: UnOp::PostInc,
                    expr: Box::new(obj),
                    span: start..span.end,
                },
                Post::Dec(span) => Expr::Unary {
                    op: UnOp::PostDec,
                    expr: Box::new(obj),
                    span: start..span.end,
                },
                Post::Spread(span) => Expr::VarArg {
                    expr: Box::new(obj),
                    span: start..span.end,
                },
            }
        });

        let unary = recursive(|unary| {
            choice((
                just(Token::Not).to(UnOp::Not),
                just(Token::Inc).to(UnOp::PreInc),
                just(Token::Dec).to(UnOp::PreDec),
                just(Token::Add).to(UnOp::Plus),
                just(Token::Sub).to(UnOp::Minus),
            ))
            .map_with_span(|op, span: Span| (op, span))
            .then(unary)
            .map(|((op, span), inner): ((UnOp, Span), Expr)| {
                let span = span.start..inner.span().end;
                Expr::Unary {
                    op,
                    expr: Box::new(inner),
                    span,
                }
            })
            .or(postfix)
        });

        // Binary operators associate to the right (`a - b - c` is
        // `a - (b - c)`), while operands still read left to right.
        fn binary_level(
            term: impl Parser<Token, Expr, Error = Err> + Clone,
            op: impl Parser<Token, BinOp, Error = Err> + Clone,
        ) -> impl Parser<Token, Expr, Error = Err> + Clone {
            term.clone()
                .then(op.then(term).repeated())
                .map(|(first, rest)| {
                    if rest.is_empty() {
                        return first;
                    }
                    let mut terms = vec![first];
                    let mut ops = Vec::with_capacity(rest.len());
                    for (op, term) in rest {
                        ops.push(op);
                        terms.push(term);
                    }
                    let mut acc = terms.pop().unwrap();
                    while let Some(op) = ops.pop() {
                        let lhs = terms.pop().unwrap();
                        let span = lhs.span().start..acc.span().end;
                        acc = Expr::Binary {
                            op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(acc),
                            span,
                        };
                    }
                    acc
                })
        }

        let product = binary_level(
            unary,
            choice((
                just(Token::Mul).to(BinOp::Mul),
                just(Token::Div).to(BinOp::Div),
                just(Token::Mod).to(BinOp::Mod),
            )),
        );
        let sum = binary_level(
            product,
            choice((just(Token::Add).to(BinOp::Add), just(Token::Sub).to(BinOp::Sub))),
        );
        let shift = binary_level(
            sum,
            choice((
                just(Token::Shl).to(BinOp::Shl),
                just(Token::UShr).to(BinOp::UShr),
                just(Token::Shr).to(BinOp::Shr),
            )),
        );
        let relational = binary_level(
            shift,
            choice((
                just(Token::Le).to(BinOp::Le),
                just(Token::Ge).to(BinOp::Ge),
                just(Token::Lt).to(BinOp::Lt),
                just(Token::Gt).to(BinOp::Gt),
            )),
        );
        let equality = binary_level(
            relational,
            choice((
                just(Token::StrictEq).to(BinOp::StrictEq),
                just(Token::StrictNe).to(BinOp::StrictNe),
                just(Token::Eq).to(BinOp::Eq),
                just(Token::Ne).to(BinOp::Ne),
            )),
        );
        let band = binary_level(equality, just(Token::BAnd).to(BinOp::BAnd));
        let bxor = binary_level(band, just(Token::BXor).to(BinOp::BXor));
        let bor = binary_level(bxor, just(Token::BOr).to(BinOp::BOr));
        let land = binary_level(bor, just(Token::LAnd).to(BinOp::LAnd));
        let lor = binary_level(land, just(Token::LOr).to(BinOp::LOr));

        // Assignment is right-associative; validity of the target is
        // checked by the HIR builder.
        lor.clone()
            .then(just(Token::Assign).ignore_then(nl()).ignore_then(expr).or_not())
            .map(|(target, value)| match value {
                Some(value) => {
                    let span = target.span().start..value.span().end;
                    Expr::Assign {
                        target: Box::new(target),
                        value: Box::new(value),
                        span,
                    }
                }
                None => target,
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Module {
        match parse_module(src) {
            Ok(m) => m,
            Err(errs) => panic!("parse failed for {:?}: {:?}", src, errs),
        }
    }

    #[test]
    fn parses_assignment_chain() {
        let m = parse("a = 1\nb = a + 2\nreturn b");
        assert_eq!(m.body.len(), 3);
        assert!(matches!(m.body[2], Stmt::Return(_)));
    }

    #[test]
    fn parses_object_and_member() {
        let m = parse("a = { a: 1, b: 2 }\nreturn a.a + a.b");
        assert_eq!(m.body.len(), 2);
        match &m.body[0] {
            Stmt::Expr(Expr::Assign { value, .. }) => match value.as_ref() {
                Expr::ObjectLit { entries, .. } => assert_eq!(entries.len(), 2),
                other => panic!("expected object literal, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn parses_function_with_varargs() {
        let m = parse("fn(a, b..., c) { return a }\nreturn fn(1, 2, [3, 4]...)");
        match &m.body[0] {
            Stmt::Expr(Expr::Function { name, params, .. }) => {
                assert_eq!(name.as_deref(), Some("fn"));
                assert!(params[1].vararg);
            }
            other => panic!("expected function, got {:?}", other),
        }
        match &m.body[1] {
            Stmt::Return(ReturnStmt {
                value: Some(Expr::Call { args, .. }),
                ..
            }) => {
                assert_eq!(args.len(), 3);
                assert!(matches!(args[2], Expr::VarArg { .. }));
            }
            other => panic!("expected return of call, got {:?}", other),
        }
    }

    #[test]
    fn parses_colon_call() {
        let m = parse("a = global\nreturn a:b(1, 2)");
        match &m.body[1] {
            Stmt::Return(ReturnStmt {
                value: Some(Expr::Call { colon, args, .. }),
                ..
            }) => {
                assert!(*colon);
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected colon call, got {:?}", other),
        }
    }

    #[test]
    fn parses_while_with_predec() {
        let m = parse("i = 10\nwhile (--i) {\n  i = i\n}\nreturn i");
        assert_eq!(m.body.len(), 3);
        match &m.body[1] {
            Stmt::While(w) => assert!(matches!(
                w.cond,
                Expr::Unary {
                    op: UnOp::PreDec,
                    ..
                }
            )),
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn parses_if_else() {
        let m = parse("if (a < 1) {\n  b = 1\n} else {\n  b = 2\n}\nreturn b");
        assert!(matches!(m.body[0], Stmt::If(_)));
    }

    #[test]
    fn parses_delete_and_introspection() {
        let m = parse("a = {}\na.b = 1\ndelete a.b\nreturn typeof a");
        assert_eq!(m.body.len(), 4);
        assert!(matches!(
            m.body[2],
            Stmt::Expr(Expr::Delete { .. })
        ));
    }
}
