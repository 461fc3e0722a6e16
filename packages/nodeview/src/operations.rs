//! Transform operations attached to assembly nodes.
//!
//! The server sends operations in their raw form, with every time-varying
//! parameter as expression text:
//!
//! - `["r", angle_expr, [ax, ay, az]]` rotates by `angle_expr` degrees about the axis
//! - `["t", [x_expr, y_expr, z_expr]]` translates by the vector
//!
//! Evaluating a [`RawOperation`] at a given time yields an [`Operation`] with
//! the same tag and arity. Operations are not commutative, so lists are always
//! processed in order; [`Operation::unapply`] is the exact inverse of
//! [`Operation::apply`] for the same evaluated values.

use std::fmt;

use glam::DVec3;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

use crate::expression::{evaluate, ExprError};
use crate::scene_graph::Pose;

const ROTATE_TAG: &str = "r";
const TRANSLATE_TAG: &str = "t";

/// An operation whose numeric parameters are still unevaluated expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOperation {
    /// Rotation by `angle` degrees about `axis`. The axis is not an expression.
    Rotate { angle: String, axis: [f64; 3] },
    Translate([String; 3]),
}

/// The evaluated counterpart of a [`RawOperation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Rotate { degrees: f64, axis: [f64; 3] },
    Translate([f64; 3]),
}

impl RawOperation {
    pub fn rotate(angle: impl Into<String>, axis: [f64; 3]) -> Self {
        RawOperation::Rotate {
            angle: angle.into(),
            axis,
        }
    }

    pub fn translate(x: impl Into<String>, y: impl Into<String>, z: impl Into<String>) -> Self {
        RawOperation::Translate([x.into(), y.into(), z.into()])
    }

    pub fn evaluate(&self, time: f64) -> Result<Operation, ExprError> {
        match self {
            RawOperation::Rotate { angle, axis } => Ok(Operation::Rotate {
                degrees: evaluate(angle, time)?,
                axis: *axis,
            }),
            RawOperation::Translate([x, y, z]) => Ok(Operation::Translate([
                evaluate(x, time)?,
                evaluate(y, time)?,
                evaluate(z, time)?,
            ])),
        }
    }

    /// The no-op with the same tag, used where an expression cannot be evaluated.
    pub fn identity(&self) -> Operation {
        match self {
            RawOperation::Rotate { axis, .. } => Operation::Rotate {
                degrees: 0.0,
                axis: *axis,
            },
            RawOperation::Translate(_) => Operation::Translate([0.0; 3]),
        }
    }
}

/// Evaluate a list of raw operations at `time`, preserving order.
pub fn evaluate_operations(raw: &[RawOperation], time: f64) -> Result<Vec<Operation>, ExprError> {
    raw.iter().map(|op| op.evaluate(time)).collect()
}

impl Operation {
    pub fn apply(&self, pose: &mut Pose) {
        match *self {
            Operation::Rotate { degrees, axis } => pose.rotate(axis, degrees.to_radians()),
            Operation::Translate(v) => pose.translate(DVec3::from_array(v)),
        }
    }

    pub fn unapply(&self, pose: &mut Pose) {
        match *self {
            Operation::Rotate { degrees, axis } => pose.rotate(axis, -degrees.to_radians()),
            Operation::Translate(v) => pose.translate(-DVec3::from_array(v)),
        }
    }
}

/// Apply every layer in ascending order, every operation in declared order.
pub fn apply_layers(layers: &[Vec<Operation>], pose: &mut Pose) {
    for layer in layers {
        for op in layer {
            op.apply(pose);
        }
    }
}

/// Undo [`apply_layers`]: layers descending, operations back to front.
pub fn unapply_layers(layers: &[Vec<Operation>], pose: &mut Pose) {
    for layer in layers.iter().rev() {
        for op in layer.iter().rev() {
            op.unapply(pose);
        }
    }
}

// === Wire format ===

/// Expression text; the server normally sends strings but plain numbers are accepted.
struct ExprText(String);

impl<'de> Deserialize<'de> for ExprText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Number(f64),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Text(text) => ExprText(text),
            Wire::Number(value) => ExprText(value.to_string()),
        })
    }
}

impl Serialize for RawOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawOperation::Rotate { angle, axis } => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element(ROTATE_TAG)?;
                tuple.serialize_element(angle)?;
                tuple.serialize_element(axis)?;
                tuple.end()
            }
            RawOperation::Translate(v) => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element(TRANSLATE_TAG)?;
                tuple.serialize_element(v)?;
                tuple.end()
            }
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Operation::Rotate { degrees, axis } => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element(ROTATE_TAG)?;
                tuple.serialize_element(degrees)?;
                tuple.serialize_element(axis)?;
                tuple.end()
            }
            Operation::Translate(v) => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element(TRANSLATE_TAG)?;
                tuple.serialize_element(v)?;
                tuple.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RawOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawOperationVisitor;

        impl<'de> Visitor<'de> for RawOperationVisitor {
            type Value = RawOperation;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"["r", angle, [x, y, z]] or ["t", [x, y, z]]"#)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RawOperation, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;

                match tag.as_str() {
                    ROTATE_TAG => {
                        let angle: ExprText = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let axis: [f64; 3] = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(RawOperation::Rotate {
                            angle: angle.0,
                            axis,
                        })
                    }
                    TRANSLATE_TAG => {
                        let [x, y, z]: [ExprText; 3] = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(RawOperation::Translate([x.0, y.0, z.0]))
                    }
                    other => Err(de::Error::unknown_variant(other, &[ROTATE_TAG, TRANSLATE_TAG])),
                }
            }
        }

        deserializer.deserialize_seq(RawOperationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_rotation_ignores_time() {
        let raw = vec![RawOperation::rotate("90", [0.0, 0.0, 1.0])];
        for t in [0.0, 0.3, 0.99] {
            assert_eq!(
                evaluate_operations(&raw, t).unwrap(),
                vec![Operation::Rotate {
                    degrees: 90.0,
                    axis: [0.0, 0.0, 1.0]
                }]
            );
        }
    }

    #[test]
    fn test_translation_follows_time() {
        let raw = vec![RawOperation::translate("$t*10", "0", "0")];
        assert_eq!(
            evaluate_operations(&raw, 0.5).unwrap(),
            vec![Operation::Translate([5.0, 0.0, 0.0])]
        );
    }

    #[test]
    fn test_evaluation_error_propagates() {
        let raw = vec![
            RawOperation::translate("1", "2", "3"),
            RawOperation::rotate("cross(1)", [1.0, 0.0, 0.0]),
        ];
        assert_eq!(
            evaluate_operations(&raw, 0.0),
            Err(ExprError::UnknownFunction("cross".to_string()))
        );
    }

    #[test]
    fn test_wire_format() {
        let json = r#"[["r", "$t * 360", [0, 0, 1]], ["t", ["10", "0", "$t"]], ["r", 45, [1, 0, 0]]]"#;
        let ops: Vec<RawOperation> = serde_json::from_str(json).unwrap();
        assert_eq!(
            ops,
            vec![
                RawOperation::rotate("$t * 360", [0.0, 0.0, 1.0]),
                RawOperation::translate("10", "0", "$t"),
                RawOperation::rotate("45", [1.0, 0.0, 0.0]),
            ]
        );

        let back = serde_json::to_string(&ops[1]).unwrap();
        assert_eq!(back, r#"["t",["10","0","$t"]]"#);

        assert!(serde_json::from_str::<RawOperation>(r#"["s", [1, 1, 1]]"#).is_err());
        assert!(serde_json::from_str::<RawOperation>(r#"["r", "90"]"#).is_err());
    }

    #[test]
    fn test_unapply_inverts_apply() {
        let ops = vec![
            Operation::Rotate {
                degrees: 30.0,
                axis: [0.0, 1.0, 0.0],
            },
            Operation::Translate([1.0, 2.0, 3.0]),
            Operation::Rotate {
                degrees: 45.0,
                axis: [1.0, 0.0, 0.0],
            },
        ];
        let layers = vec![ops.clone(), ops];
        let mut pose = Pose::default();

        apply_layers(&layers, &mut pose);
        assert!(pose.position.distance(DVec3::new(2.0, 4.0, 6.0)) < 1e-12);
        assert!(pose.orientation.angle_between(glam::DQuat::IDENTITY) > 0.1);

        unapply_layers(&layers, &mut pose);
        assert!(pose.position.length() < 1e-12);
        assert!(pose.orientation.abs_diff_eq(glam::DQuat::IDENTITY, 1e-12));
    }
}
