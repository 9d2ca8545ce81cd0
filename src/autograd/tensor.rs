//! Tensor with shared storage and reverse-mode gradient support.
//!
//! Tensors are flat 1-D f32 buffers; matrix shape is carried by the operation
//! that consumes them. Cloning a tensor shares storage, gradient, and the
//! recorded backward operation, so parameters handed to an optimizer alias
//! the ones inside the model.

use ndarray::Array1;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;

/// Backward step recorded by a differentiable operation.
///
/// `backward` propagates the result gradient one hop into the input tensors.
/// It must not recurse; graph traversal order is owned by [`Tensor::backward`],
/// which calls each recorded operation exactly once. This keeps gradients
/// correct on diamond-shaped graphs (residual connections), where a
/// per-operation recursion would visit shared subgraphs multiple times and
/// double-count their gradients.
pub trait BackwardOp {
    /// Accumulate gradients into this operation's input tensors.
    fn backward(&self);

    /// Input tensors consumed by this operation.
    fn inputs(&self) -> Vec<Tensor>;
}

/// Flat f32 tensor with optional gradient.
#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Array1<f32>>>,
    grad: Rc<RefCell<Option<Array1<f32>>>>,
    requires_grad: Rc<Cell<bool>>,
    backward_op: Rc<RefCell<Option<Rc<dyn BackwardOp>>>>,
}

impl Tensor {
    /// Create a tensor from an ndarray buffer.
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self {
            data: Rc::new(RefCell::new(data)),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: Rc::new(Cell::new(requires_grad)),
            backward_op: Rc::new(RefCell::new(None)),
        }
    }

    /// Create a tensor from a plain vector.
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data), requires_grad)
    }

    /// Create a zero-filled tensor of the given length.
    pub fn zeros(len: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(len), requires_grad)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the underlying buffer.
    pub fn data(&self) -> Ref<'_, Array1<f32>> {
        self.data.borrow()
    }

    /// Mutably borrow the underlying buffer.
    pub fn data_mut(&self) -> RefMut<'_, Array1<f32>> {
        self.data.borrow_mut()
    }

    /// Whether gradients are tracked for this tensor.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad.get()
    }

    /// Enable or disable gradient tracking. Shared across clones.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.set(requires_grad);
    }

    /// Current gradient, if one has been accumulated.
    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    /// Replace the gradient. Used to seed backward from a loss.
    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Add into the gradient, initializing it if absent.
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut slot = self.grad.borrow_mut();
        match slot.as_mut() {
            Some(existing) => *existing += &grad,
            None => *slot = Some(grad),
        }
    }

    /// Clear the gradient.
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Shared handle to the gradient cell, stored by backward operations.
    pub fn grad_cell(&self) -> Rc<RefCell<Option<Array1<f32>>>> {
        Rc::clone(&self.grad)
    }

    /// The operation that produced this tensor, if any.
    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.borrow().clone()
    }

    /// Record the operation that produced this tensor.
    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        *self.backward_op.borrow_mut() = Some(op);
    }

    /// Run reverse-mode differentiation from this tensor.
    ///
    /// The caller seeds `self` with a gradient first (via [`set_grad`] or
    /// [`accumulate_grad`]). Operations are ordered topologically and each
    /// runs exactly once, so gradients through shared subexpressions are
    /// accumulated rather than recomputed.
    ///
    /// [`set_grad`]: Tensor::set_grad
    /// [`accumulate_grad`]: Tensor::accumulate_grad
    pub fn backward(&self) {
        let root = match self.backward_op() {
            Some(op) => op,
            None => return,
        };

        // Iterative post-order DFS keyed by operation identity.
        let mut order: Vec<Rc<dyn BackwardOp>> = Vec::new();
        let mut seen: HashSet<*const ()> = HashSet::new();
        let mut stack: Vec<(Rc<dyn BackwardOp>, bool)> = vec![(root, false)];

        while let Some((op, expanded)) = stack.pop() {
            if expanded {
                order.push(op);
                continue;
            }
            let key = Rc::as_ptr(&op) as *const ();
            if !seen.insert(key) {
                continue;
            }
            stack.push((Rc::clone(&op), true));
            for input in op.inputs() {
                if let Some(producer) = input.backward_op() {
                    let pkey = Rc::as_ptr(&producer) as *const ();
                    if !seen.contains(&pkey) {
                        stack.push((producer, false));
                    }
                }
            }
        }

        for op in order.iter().rev() {
            op.backward();
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("len", &self.len())
            .field("requires_grad", &self.requires_grad())
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}
