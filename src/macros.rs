/// Implements [`Interface`](crate::Interface) for a trait object type from a
/// descriptor string and its method descriptors.
///
/// ```ignore
/// const GREET: Method<dyn Greeter, String, String> = Method::new(1, "greet", |g, n| g.greet(n));
/// const FORGET: OnewayMethod<dyn Greeter, String> = OnewayMethod::new(2, "forget", |g, n| g.forget(n));
///
/// interface!(dyn Greeter, "example.Greeter", [GREET, FORGET]);
/// ```
#[macro_export]
macro_rules! interface {
    ($iface:ty, $descriptor:expr, [$($method:expr),* $(,)?]) => {
        impl $crate::Interface for $iface {
            const DESCRIPTOR: &'static str = $descriptor;

            #[allow(unused_mut)]
            fn methods() -> $crate::MethodTable<Self> {
                let mut table = $crate::MethodTable::new();
                $(table.add($method);)*
                table
            }
        }
    };
}
