use itertools::Itertools;
use std::collections::BTreeSet;
use z3::DeclKind;
use z3::ast::{Ast, BV, Dynamic};

/// Read an address term as "symbolic base plus constant offset", in every way it
/// can be read. The result groups offsets by base: a base of `None` means the
/// offsets are absolute addresses. Conditional sub-terms fork the reading (each
/// arm is an alternative), which is how one base can end up with several
/// offsets.
///
/// The input is expected to be pre-simplified; constant folding is the
/// simplifier's job, this walk only takes terms apart.
pub(crate) fn decompose<'ctx>(expr: &BV<'ctx>) -> Vec<(Option<BV<'ctx>>, BTreeSet<i64>)> {
    let mut grouped: Vec<(Option<BV<'ctx>>, BTreeSet<i64>)> = Vec::new();
    for (base, offset) in alternatives(expr) {
        match grouped.iter_mut().find(|(b, _)| *b == base) {
            Some((_, offsets)) => {
                offsets.insert(offset);
            }
            None => grouped.push((base, BTreeSet::from([offset]))),
        }
    }
    grouped
}

/// All (base, offset) readings of one term.
fn alternatives<'ctx>(expr: &BV<'ctx>) -> Vec<(Option<BV<'ctx>>, i64)> {
    if let Some(constant) = numeral_value(expr) {
        return vec![(None, constant)];
    }
    match app_kind(expr) {
        Some(DeclKind::ITE) => {
            let children = expr.children();
            let mut readings = branch_alternatives(children.get(1));
            readings.extend(branch_alternatives(children.get(2)));
            readings
        }
        Some(DeclKind::BADD) => {
            let per_term: Vec<Vec<(Option<BV<'ctx>>, i64)>> = expr
                .children()
                .iter()
                .filter_map(Dynamic::as_bv)
                .map(|term| alternatives(&term))
                .collect();
            per_term
                .into_iter()
                .multi_cartesian_product()
                .map(|reading| {
                    let mut offset = 0i64;
                    let mut bases = Vec::new();
                    for (base, term_offset) in reading {
                        offset = offset.wrapping_add(term_offset);
                        if let Some(base) = base {
                            bases.push(base);
                        }
                    }
                    (rebuild_sum(bases), offset)
                })
                .collect()
        }
        _ => vec![(Some(expr.clone()), 0)],
    }
}

fn branch_alternatives<'ctx>(child: Option<&Dynamic<'ctx>>) -> Vec<(Option<BV<'ctx>>, i64)> {
    child
        .and_then(Dynamic::as_bv)
        .map(|arm| alternatives(&arm))
        .unwrap_or_default()
}

/// Sum the non-constant terms of an addition back into a single base term.
fn rebuild_sum<'ctx>(bases: Vec<BV<'ctx>>) -> Option<BV<'ctx>> {
    let mut terms = bases.into_iter();
    let first = terms.next()?;
    Some(terms.fold(first, |sum, term| sum.bvadd(&term)))
}

fn app_kind(expr: &BV) -> Option<DeclKind> {
    if !expr.is_app() {
        return None;
    }
    Some(expr.decl().kind())
}

/// The value of a numeral term, reinterpreted as signed within its own width so
/// that `base - 8` reads as offset -8 rather than an enormous positive one.
fn numeral_value(expr: &BV) -> Option<i64> {
    let raw = expr.as_u64()?;
    let width = expr.get_size();
    if width >= 64 {
        return Some(raw as i64);
    }
    let sign_bit = 1u64 << (width - 1);
    if raw & sign_bit != 0 {
        Some((raw | !((1u64 << width) - 1)) as i64)
    } else {
        Some(raw as i64)
    }
}
