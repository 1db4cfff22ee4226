use std::future::Future;
use std::pin::Pin;

/// A typed RPC method of 0..=5 positional arguments.
///
/// Implemented for async functions and closures; `Args` is the tuple of
/// argument types, which travels on the wire as one encoded tuple blob. The
/// server decodes the blob, invokes the method, and encodes the returned value
/// into the response envelope.
pub trait RpcMethod<Args, Ret>: Send + Sync + 'static {
    fn invoke(&self, args: Args) -> Pin<Box<dyn Future<Output = Ret> + Send>>;
}

macro_rules! impl_rpc_method {
    ($($arg:ident),*) => {
        impl<Func, Fut, Ret, $($arg),*> RpcMethod<($($arg,)*), Ret> for Func
        where
            Func: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Ret> + Send + 'static,
            $($arg: Send + 'static,)*
        {
            #[allow(non_snake_case)]
            fn invoke(&self, ($($arg,)*): ($($arg,)*)) -> Pin<Box<dyn Future<Output = Ret> + Send>> {
                Box::pin((self)($($arg),*))
            }
        }
    };
}

impl_rpc_method!();
impl_rpc_method!(A0);
impl_rpc_method!(A0, A1);
impl_rpc_method!(A0, A1, A2);
impl_rpc_method!(A0, A1, A2, A3);
impl_rpc_method!(A0, A1, A2, A3, A4);
