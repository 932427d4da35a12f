use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use futures::future::BoxFuture;

use strand_core::error::{GraphAssemblyError, Result};

use crate::context::ProcessContext;

/// Type-erased value flowing between nodes.
pub type Value = Box<dyn Any + Send>;

/// A unit of work in the graph: consumes one input and produces one output.
///
/// Implementations receive the run's [`ProcessContext`], through which they
/// reach registered agents, the cancellation token, and the completion
/// signal.
pub trait Runnable: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: fmt::Debug + Send + 'static;

    fn invoke<'a>(
        &'a self,
        ctx: &'a ProcessContext,
        input: Self::Input,
    ) -> BoxFuture<'a, Result<Self::Output>>;
}

/// Runnable backed by an async closure.
pub struct FnNode<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Wrap `f` as a node. The closure gets an owned context clone.
///
/// ```ignore
/// let double = node_fn(|_ctx, n: u32| async move { Ok(n * 2) });
/// ```
pub fn node_fn<I, O, F, Fut>(f: F) -> FnNode<I, O, F>
where
    I: Send + 'static,
    O: fmt::Debug + Send + 'static,
    F: Fn(ProcessContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    FnNode {
        f,
        _types: PhantomData,
    }
}

impl<I, O, F, Fut> Runnable for FnNode<I, O, F>
where
    I: Send + 'static,
    O: fmt::Debug + Send + 'static,
    F: Fn(ProcessContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn invoke<'a>(&'a self, ctx: &'a ProcessContext, input: I) -> BoxFuture<'a, Result<O>> {
        Box::pin((self.f)(ctx.clone(), input))
    }
}

pub(crate) trait ErasedRunnable: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a ProcessContext, input: Value) -> BoxFuture<'a, Result<Value>>;

    /// Debug rendering of an output this runnable produced.
    fn render(&self, output: &dyn Any) -> String;
}

pub(crate) struct Erased<R>(pub R);

impl<R: Runnable> ErasedRunnable for Erased<R> {
    fn invoke<'a>(&'a self, ctx: &'a ProcessContext, input: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let input = input.downcast::<R::Input>().map_err(|_| {
                GraphAssemblyError::InputTypeMismatch {
                    node: ctx.node_path().to_string(),
                    expected: type_name::<R::Input>(),
                    found: "another type",
                }
            })?;
            let output = self.0.invoke(ctx, *input).await?;
            Ok(Box::new(output) as Value)
        })
    }

    fn render(&self, output: &dyn Any) -> String {
        output
            .downcast_ref::<R::Output>()
            .map(|o| format!("{:?}", o))
            .unwrap_or_else(|| format!("<{}>", type_name::<R::Output>()))
    }
}
