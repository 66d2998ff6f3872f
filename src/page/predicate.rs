/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::value::Value;
use std::cmp::Ordering;

/// Comparison operator carried by a `Predicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single-column predicate: `column <comparator> operand`.
///
/// NULL comparisons are monotone-false: `evaluate_with_null` returns `false`
/// whenever either side is NULL, for every comparator (including `Ne`).
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: usize,
    pub comparator: Comparator,
    pub operand: Value,
}

impl Predicate {
    pub fn new(column: usize, comparator: Comparator, operand: Value) -> Self {
        Self {
            column,
            comparator,
            operand,
        }
    }

    /// Evaluate this predicate against a decoded field value. Returns
    /// `false` if either the field or the operand is NULL.
    pub fn evaluate_with_null(&self, field: &Value) -> bool {
        if field.is_null() || self.operand.is_null() {
            return false;
        }
        match value_cmp(field, &self.operand) {
            Some(ordering) => match self.comparator {
                Comparator::Eq => ordering == Ordering::Equal,
                Comparator::Ne => ordering != Ordering::Equal,
                Comparator::Lt => ordering == Ordering::Less,
                Comparator::Le => ordering != Ordering::Greater,
                Comparator::Gt => ordering == Ordering::Greater,
                Comparator::Ge => ordering != Ordering::Less,
            },
            // Values of incomparable types/variants never satisfy a
            // predicate.
            None => false,
        }
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::SmallInt(x), Value::SmallInt(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::BigInt(x), Value::BigInt(y)) => x.partial_cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Double(x), Value::Double(y)) => x.partial_cmp(y),
        (Value::Char(x), Value::Char(y)) => x.partial_cmp(y),
        (Value::Varchar(x), Value::Varchar(y)) => x.partial_cmp(y),
        (Value::Date(x), Value::Date(y)) => x.partial_cmp(y),
        (Value::Time(x), Value::Time(y)) => x.partial_cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.partial_cmp(y),
        _ => None,
    }
}
