//! Reference operators.
//!
//! Small, dense `f32` kernels implementing [`Operator`]. They exist so the
//! engine can be exercised end to end (tests, benchmarks, doc examples); a
//! real model plugs in its own operators through the same trait.
//!
//! Every operator writes only the output columns of the current range and
//! accumulates into input gradients, never overwriting them.

use crate::graph::{BackwardContext, Cols, ForwardContext, Operator, Shape, ShapeError};

fn expect_inputs(inputs: &[Shape], expected: usize) -> Result<(), ShapeError> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(ShapeError::InputCount {
            expected,
            found: inputs.len(),
        })
    }
}

/// Element-wise sum of two same-shaped inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plus;

impl Operator for Plus {
    fn operation_name(&self) -> &'static str {
        "Plus"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        expect_inputs(inputs, 2)?;
        if inputs[1] != inputs[0] {
            return Err(ShapeError::Mismatch {
                input: 1,
                expected: inputs[0],
                found: inputs[1],
            });
        }
        Ok(inputs[0])
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.output_columns();
        let a = ctx.input_value(0).columns(cols.clone());
        let b = ctx.input_value(1).columns(cols.clone());
        let out = ctx.output_mut().columns_mut(cols);
        for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
            *o = x + y;
        }
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.output_columns();
        let g = ctx.output_gradient().columns(cols.clone());
        let acc = ctx.input_gradient_mut().columns_mut(cols);
        for (a, &d) in acc.iter_mut().zip(g) {
            *a += d;
        }
    }

    fn output_needed_for_gradient(&self) -> bool {
        false
    }

    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        false
    }
}

/// Multiplies its input by a constant.
#[derive(Debug, Clone, Copy)]
pub struct Scale(pub f32);

impl Operator for Scale {
    fn operation_name(&self) -> &'static str {
        "Scale"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        expect_inputs(inputs, 1)?;
        Ok(inputs[0])
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.output_columns();
        let x = ctx.input_value(0).columns(cols.clone());
        let out = ctx.output_mut().columns_mut(cols);
        for (o, &v) in out.iter_mut().zip(x) {
            *o = self.0 * v;
        }
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.output_columns();
        let g = ctx.output_gradient().columns(cols.clone());
        let acc = ctx.input_gradient_mut().columns_mut(cols);
        for (a, &d) in acc.iter_mut().zip(g) {
            *a += self.0 * d;
        }
    }

    fn output_needed_for_gradient(&self) -> bool {
        false
    }

    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        false
    }
}

/// Matrix product `W * x` of a fixed-shape weight and a second input.
///
/// The weight must have `Cols::Fixed(k)` where `k` is the row count of `x`;
/// the output has the rows of `W` and the columns of `x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Times;

impl Operator for Times {
    fn operation_name(&self) -> &'static str {
        "Times"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        expect_inputs(inputs, 2)?;
        let (w, x) = (inputs[0], inputs[1]);
        let Cols::Fixed(k) = w.cols else {
            return Err(ShapeError::Mismatch {
                input: 0,
                expected: Shape::fixed(w.rows, x.rows),
                found: w,
            });
        };
        if x.rows != k {
            return Err(ShapeError::Mismatch {
                input: 1,
                expected: Shape::new(k, x.cols),
                found: x,
            });
        }
        Ok(Shape::new(w.rows, x.cols))
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.output_columns();
        let w = ctx.input_value(0);
        let x = ctx.input_value(1);
        let out = ctx.output_mut();
        for c in cols {
            let oc = out.column_mut(c);
            oc.fill(0.0);
            for (j, &xj) in x.column(c).iter().enumerate() {
                for (o, &wr) in oc.iter_mut().zip(w.column(j)) {
                    *o += wr * xj;
                }
            }
        }
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.output_columns();
        let g = ctx.output_gradient();
        match ctx.input_index() {
            0 => {
                // dW += g * x^T
                let x = ctx.input(1);
                let acc = ctx.input_gradient_mut();
                for c in cols {
                    let gc = g.column(c);
                    for (j, &xj) in x.column(c).iter().enumerate() {
                        for (a, &gr) in acc.column_mut(j).iter_mut().zip(gc) {
                            *a += gr * xj;
                        }
                    }
                }
            }
            _ => {
                // dx += W^T * g
                let w = ctx.input(0);
                let acc = ctx.input_gradient_mut();
                for c in cols {
                    let gc = g.column(c);
                    for (j, a) in acc.column_mut(c).iter_mut().enumerate() {
                        *a += w.column(j).iter().zip(gc).map(|(&wr, &gr)| wr * gr).sum::<f32>();
                    }
                }
            }
        }
    }

    fn output_needed_for_gradient(&self) -> bool {
        false
    }
}

/// Sum of every element in the range, as a `1 x 1` value.
///
/// Typically the criterion at the top of a graph. Not meant for use inside
/// a loop, where each step would overwrite the previous partial sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceSum;

impl Operator for ReduceSum {
    fn operation_name(&self) -> &'static str {
        "ReduceSum"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        expect_inputs(inputs, 1)?;
        Ok(Shape::fixed(1, 1))
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.input_columns(0);
        let sum: f32 = ctx.input_value(0).columns(cols).iter().sum();
        ctx.output_mut().set(0, 0, sum);
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.input_columns(0);
        let g = ctx.output_gradient().get(0, 0);
        for a in ctx.input_gradient_mut().columns_mut(cols) {
            *a += g;
        }
    }

    fn output_needed_for_gradient(&self) -> bool {
        false
    }

    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        false
    }
}

/// Element-wise hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Operator for Tanh {
    fn operation_name(&self) -> &'static str {
        "Tanh"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        expect_inputs(inputs, 1)?;
        Ok(inputs[0])
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.output_columns();
        let x = ctx.input_value(0).columns(cols.clone());
        let out = ctx.output_mut().columns_mut(cols);
        for (o, &v) in out.iter_mut().zip(x) {
            *o = v.tanh();
        }
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.output_columns();
        let y = ctx.output().columns(cols.clone());
        let g = ctx.output_gradient().columns(cols.clone());
        let acc = ctx.input_gradient_mut().columns_mut(cols);
        for ((a, &d), &v) in acc.iter_mut().zip(g).zip(y) {
            *a += d * (1.0 - v * v);
        }
    }

    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        false
    }
}
