//! Serial element-index emission: one counted loop over every element.

use tracing::debug;

use super::{
    assert_index_type_fits, common_target_shape, make_body_emitter, BodyEmitter, ElementGenerator,
    IndexEmitter, IrArray, LogicalIndex,
};
use crate::kir::builder::KernelBuilder;
use crate::kir::{BlockId, IntType, Value};
use crate::shape::Shape;

/// Emits `for (i = 0; i < element_count; ++i) body(index_of(i))`.
pub struct LoopEmitter<'a, E> {
    body: BodyEmitter<'a, E>,
    shape: Shape,
    exit_block: Option<BlockId>,
}

impl<'a, E: 'a> LoopEmitter<'a, E> {
    pub fn new(body: BodyEmitter<'a, E>, shape: &Shape) -> Self {
        Self {
            body,
            shape: shape.clone(),
            exit_block: None,
        }
    }

    /// Store the generator's values into `targets` at every index.
    pub fn from_element_generator(generator: ElementGenerator<'a, E>, targets: Vec<IrArray>) -> Self {
        let shape = common_target_shape(&targets);
        Self::new(make_body_emitter(generator, targets), &shape)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
}

impl<'a, E: 'a> IndexEmitter for LoopEmitter<'a, E> {
    type Error = E;

    fn emit_index_and_set_exit_block(
        &mut self,
        b: &mut KernelBuilder,
        loop_name: &str,
        index_type: IntType,
        base_index: Option<Value>,
    ) -> Vec<LogicalIndex> {
        assert!(
            base_index.is_none(),
            "serial loop emission does not take a base index"
        );
        let n = self.shape.element_count();
        assert_index_type_fits(index_type, n.saturating_add(1), "element count");
        debug!(shape = %self.shape, elements = n, "serial loop");

        let for_loop = b.emit_for_loop(
            &format!("{}.loop", loop_name),
            Value::Imm(0),
            Value::Imm(n),
            Value::Imm(1),
            index_type,
        );
        self.exit_block = Some(for_loop.exit);
        vec![LogicalIndex::from_linear(
            Value::Reg(for_loop.indvar),
            &self.shape,
            index_type,
            b,
        )]
    }

    fn exit_block(&self) -> Option<BlockId> {
        self.exit_block
    }

    fn emit_body(&mut self, b: &mut KernelBuilder, index: &LogicalIndex) -> Result<(), E> {
        (self.body)(b, index)
    }
}
