//! Grammar rules and packed rule codes.
//!
//! A rule is one of three shapes: a binary rewrite `P -> L R`, a unary
//! rewrite `P -> C`, or a terminal `P -> word`. Rules compare structurally,
//! so two rules with the same fields are the same rule.

use crate::intern::LabelId;
use std::fmt;

/// Dense id of a rule within its own type's enumeration.
pub type RuleId = u32;

/// Packed `(type << 16) | id` key used by the scoring model.
pub type RuleCode = u32;

/// Number of bits reserved for the rule id inside a [`RuleCode`].
pub const RULE_ID_BITS: u32 = 16;

/// Largest rule id that fits in a [`RuleCode`].
pub const MAX_RULE_ID: RuleId = (1 << RULE_ID_BITS) - 1;

/// The shape of a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleType {
    Terminal = 0,
    Unary = 1,
    Binary = 2,
}

impl RuleType {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(RuleType::Terminal),
            1 => Some(RuleType::Unary),
            2 => Some(RuleType::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Terminal => write!(f, "terminal"),
            RuleType::Unary => write!(f, "unary"),
            RuleType::Binary => write!(f, "binary"),
        }
    }
}

/// A grammar rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rule {
    Terminal {
        parent: LabelId,
    },
    Unary {
        parent: LabelId,
        child: LabelId,
    },
    Binary {
        parent: LabelId,
        left: LabelId,
        right: LabelId,
    },
}

impl Rule {
    pub fn terminal(parent: LabelId) -> Self {
        Rule::Terminal { parent }
    }

    pub fn unary(parent: LabelId, child: LabelId) -> Self {
        Rule::Unary { parent, child }
    }

    pub fn binary(parent: LabelId, left: LabelId, right: LabelId) -> Self {
        Rule::Binary {
            parent,
            left,
            right,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self {
            Rule::Terminal { .. } => RuleType::Terminal,
            Rule::Unary { .. } => RuleType::Unary,
            Rule::Binary { .. } => RuleType::Binary,
        }
    }

    /// The label this rule produces.
    pub fn parent(&self) -> LabelId {
        match *self {
            Rule::Terminal { parent } | Rule::Unary { parent, .. } | Rule::Binary { parent, .. } => {
                parent
            }
        }
    }

    /// Child labels in left-to-right order.
    pub fn children(&self) -> ChildLabels {
        match *self {
            Rule::Terminal { .. } => ChildLabels::None,
            Rule::Unary { child, .. } => ChildLabels::One(child),
            Rule::Binary { left, right, .. } => ChildLabels::Two(left, right),
        }
    }
}

/// Children of a rule, see [`Rule::children`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildLabels {
    None,
    One(LabelId),
    Two(LabelId, LabelId),
}

/// Pack a rule type and id into a rule code.
pub fn rule_code(rule_type: RuleType, id: RuleId) -> RuleCode {
    debug_assert!(id <= MAX_RULE_ID);
    ((rule_type as u32) << RULE_ID_BITS) | (id & MAX_RULE_ID)
}

/// Split a rule code back into its type and id.
pub fn unpack_rule_code(code: RuleCode) -> Option<(RuleType, RuleId)> {
    let rule_type = RuleType::from_bits(code >> RULE_ID_BITS)?;
    Some((rule_type, code & MAX_RULE_ID))
}
